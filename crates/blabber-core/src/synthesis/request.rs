//! Synthesis request sent to the text-to-speech endpoint

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::VoiceDefaults;
use crate::error::{Error, Result};

/// Output encoding of synthesized audio. The pipeline only plays Ogg Opus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    #[default]
    OggOpus,
}

/// Speaker gender requested from the endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SsmlGender {
    #[default]
    Neutral,
    Male,
    Female,
    SsmlVoiceGenderUnspecified,
}

impl SsmlGender {
    pub fn as_str(&self) -> &'static str {
        match self {
            SsmlGender::Neutral => "NEUTRAL",
            SsmlGender::Male => "MALE",
            SsmlGender::Female => "FEMALE",
            SsmlGender::SsmlVoiceGenderUnspecified => "SSML_VOICE_GENDER_UNSPECIFIED",
        }
    }
}

impl fmt::Display for SsmlGender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SsmlGender {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NEUTRAL" => Ok(SsmlGender::Neutral),
            "MALE" => Ok(SsmlGender::Male),
            "FEMALE" => Ok(SsmlGender::Female),
            "SSML_VOICE_GENDER_UNSPECIFIED" | "UNSPECIFIED" => {
                Ok(SsmlGender::SsmlVoiceGenderUnspecified)
            }
            other => Err(Error::InvalidRequest(format!("unknown gender: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct AudioConfig {
    audio_encoding: AudioEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct SynthesisInput {
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceSelection {
    language_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    ssml_gender: SsmlGender,
}

/// One phrase to synthesize. Serializes to the endpoint's request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesisRequest {
    audio_config: AudioConfig,
    input: SynthesisInput,
    voice: VoiceSelection,
}

impl SynthesisRequest {
    /// Request with `en-US`, neutral gender and the endpoint's default voice
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_defaults(text, &VoiceDefaults::default())
    }

    pub fn with_defaults(text: impl Into<String>, defaults: &VoiceDefaults) -> Self {
        Self {
            audio_config: AudioConfig {
                audio_encoding: AudioEncoding::OggOpus,
            },
            input: SynthesisInput { text: text.into() },
            voice: VoiceSelection {
                language_code: defaults.language_code.clone(),
                name: defaults.name.clone(),
                ssml_gender: defaults.gender,
            },
        }
    }

    pub fn voice(mut self, name: impl Into<String>) -> Self {
        self.voice.name = Some(name.into());
        self
    }

    pub fn language(mut self, code: impl Into<String>) -> Self {
        self.voice.language_code = code.into();
        self
    }

    pub fn gender(mut self, gender: SsmlGender) -> Self {
        self.voice.ssml_gender = gender;
        self
    }

    pub fn text(&self) -> &str {
        &self.input.text
    }

    pub fn voice_name(&self) -> Option<&str> {
        self.voice.name.as_deref()
    }

    pub fn language_code(&self) -> &str {
        &self.voice.language_code
    }

    pub fn ssml_gender(&self) -> SsmlGender {
        self.voice.ssml_gender
    }

    pub fn encoding(&self) -> AudioEncoding {
        self.audio_config.audio_encoding
    }

    /// Reject empty text and text over `max_chars` characters
    pub fn validate(&self, max_chars: usize) -> Result<()> {
        if self.input.text.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "Text-to-speech messages must not be empty".to_string(),
            ));
        }
        if self.input.text.chars().count() > max_chars {
            return Err(Error::InvalidRequest(format!(
                "Text-to-speech messages must be less than {} characters",
                max_chars
            )));
        }
        if self.voice.language_code.trim().is_empty() {
            return Err(Error::InvalidRequest(
                "Language code must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
