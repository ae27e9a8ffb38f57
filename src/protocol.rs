use serde::Serialize;

use crate::normalize::NormalizedText;

/// `POST /process-text` success body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextResponse {
    pub preprocessed_text: NormalizedText,
    pub embeddings: Vec<f32>,
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

/// `POST /transcribe` success body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscribeResponse {
    pub preprocessed_text: NormalizedText,
    pub embeddings: Vec<f32>,
}

/// `POST /process-image` success body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageResponse {
    pub image_features: Vec<f32>,
}

/// Whatever the orchestrator produced; serialized without a tag so each route
/// keeps its flat body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Processed {
    Text(TextResponse),
    Audio(TranscribeResponse),
    Image(ImageResponse),
}

#[derive(Debug, Serialize)]
pub struct ResponseErr {
    pub error: String,
}
