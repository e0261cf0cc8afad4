//! Credit cost of a request.

use serde::{Deserialize, Serialize};

use crate::payload::JobPayload;

/// Credit price list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditPricing {
    pub story_per_scene: i64,
    pub voice_over: i64,
    pub effect: i64,
    pub generation_lib: i64,
}

impl Default for CreditPricing {
    fn default() -> Self {
        Self {
            story_per_scene: 10,
            voice_over: 5,
            effect: 20,
            generation_lib: 15,
        }
    }
}

impl CreditPricing {
    pub fn cost(&self, payload: &JobPayload) -> i64 {
        match payload {
            JobPayload::Story(story) => {
                let scenes = self.story_per_scene * i64::from(story.num_of_scenes);
                match story.voice_over {
                    Some(_) => scenes + self.voice_over,
                    None => scenes,
                }
            }
            JobPayload::Effect(_) => self.effect,
            JobPayload::GenerationLib(_) => self.generation_lib,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{AspectRatio, StoryRequest, VoiceOverRequest};
    use proptest::prelude::*;

    fn story(scenes: u8, voice: bool) -> JobPayload {
        JobPayload::Story(StoryRequest {
            prompt: "p".to_string(),
            num_of_scenes: scenes,
            style: None,
            aspect_ratio: AspectRatio::Portrait,
            voice_over: voice.then(|| VoiceOverRequest {
                voice_id: None,
                gender: None,
                language: "en".to_string(),
            }),
        })
    }

    #[test]
    fn story_cost_scales_with_scenes_and_voice() {
        let pricing = CreditPricing::default();
        assert_eq!(pricing.cost(&story(3, false)), 30);
        assert_eq!(pricing.cost(&story(3, true)), 35);
    }

    proptest! {
        #[test]
        fn story_cost_is_monotonic_in_scenes(a in 1u8..8, voice in any::<bool>()) {
            let pricing = CreditPricing::default();
            prop_assert!(pricing.cost(&story(a + 1, voice)) > pricing.cost(&story(a, voice)));
        }
    }
}
