//! Request shaping for Bedrock image generation models.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_count")]
    pub number_of_images: u32,
    #[serde(default = "default_dimension")]
    pub width: u32,
    #[serde(default = "default_dimension")]
    pub height: u32,
    #[serde(default = "default_cfg_scale")]
    pub cfg_scale: f32,
    #[serde(default = "default_steps")]
    pub steps: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    #[serde(default = "default_aspect_ratio")]
    pub aspect_ratio: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
}

fn default_count() -> u32 {
    1
}

fn default_dimension() -> u32 {
    1024
}

fn default_cfg_scale() -> f32 {
    8.0
}

fn default_steps() -> u32 {
    50
}

fn default_aspect_ratio() -> String {
    "1:1".to_string()
}

fn default_output_format() -> String {
    "png".to_string()
}

impl ImageRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            number_of_images: default_count(),
            width: default_dimension(),
            height: default_dimension(),
            cfg_scale: default_cfg_scale(),
            steps: default_steps(),
            seed: None,
            aspect_ratio: default_aspect_ratio(),
            output_format: default_output_format(),
        }
    }
}

/// Image model request schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFamily {
    /// Amazon Titan Image Generator and Nova Canvas (`TEXT_IMAGE` task).
    TitanCanvas,
    /// Stability SDXL-style models (`text_prompts`).
    StabilityDiffusion,
    /// Stability SD3 / Core / Ultra (`prompt` + `aspect_ratio`).
    StabilityCore,
}

impl ImageFamily {
    pub fn from_model_id(model_id: &str) -> Result<Self> {
        let id = model_id.to_ascii_lowercase();
        if id.contains("titan-image") || id.contains("nova-canvas") {
            Ok(ImageFamily::TitanCanvas)
        } else if id.contains("stability.") {
            if ["sd3", "ultra", "core"].iter().any(|k| id.contains(k)) {
                Ok(ImageFamily::StabilityCore)
            } else {
                Ok(ImageFamily::StabilityDiffusion)
            }
        } else {
            Err(GatewayError::UnsupportedModel(model_id.to_string()))
        }
    }
}

pub fn encode_image_request(model_id: &str, request: &ImageRequest) -> Result<Value> {
    if request.prompt.trim().is_empty() {
        return Err(GatewayError::Validation("image prompt is required".into()));
    }
    let family = ImageFamily::from_model_id(model_id)?;

    let body = match family {
        ImageFamily::TitanCanvas => {
            let mut text_params = json!({"text": request.prompt});
            if let Some(negative) = &request.negative_prompt {
                text_params["negativeText"] = json!(negative);
            }
            let mut config = json!({
                "numberOfImages": request.number_of_images,
                "width": request.width,
                "height": request.height,
                "cfgScale": request.cfg_scale,
            });
            if let Some(seed) = request.seed {
                config["seed"] = json!(seed);
            }
            json!({
                "taskType": "TEXT_IMAGE",
                "textToImageParams": text_params,
                "imageGenerationConfig": config,
            })
        }
        ImageFamily::StabilityDiffusion => {
            let mut prompts = vec![json!({"text": request.prompt, "weight": 1.0})];
            if let Some(negative) = &request.negative_prompt {
                prompts.push(json!({"text": negative, "weight": -1.0}));
            }
            let mut body = json!({
                "text_prompts": prompts,
                "cfg_scale": request.cfg_scale,
                "steps": request.steps,
                "width": request.width,
                "height": request.height,
            });
            if let Some(seed) = request.seed {
                body["seed"] = json!(seed);
            }
            body
        }
        ImageFamily::StabilityCore => {
            let mut body = json!({
                "prompt": request.prompt,
                "aspect_ratio": request.aspect_ratio,
                "output_format": request.output_format,
            });
            if let Some(negative) = &request.negative_prompt {
                body["negative_prompt"] = json!(negative);
            }
            if let Some(seed) = request.seed {
                body["seed"] = json!(seed);
            }
            body
        }
    };
    Ok(body)
}

/// Base64 images from an image model response (`images` or `artifacts[].base64`).
pub fn decode_image_response(response: &Value) -> Result<Vec<String>> {
    if let Some(err) = response.get("error").and_then(Value::as_str) {
        return Err(GatewayError::Parse(format!("image model error: {err}")));
    }

    let images: Vec<String> = if let Some(images) = response.get("images").and_then(Value::as_array)
    {
        images
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    } else if let Some(artifacts) = response.get("artifacts").and_then(Value::as_array) {
        artifacts
            .iter()
            .filter_map(|a| a.get("base64").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    } else {
        Vec::new()
    };

    if images.is_empty() {
        return Err(GatewayError::Parse("image response contained no images".into()));
    }
    Ok(images)
}
