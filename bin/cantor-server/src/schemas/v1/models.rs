use cantor_core::ModelInfo;
use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelResponse {
    /// Repository id to pass as `model_id`.
    pub id: String,
    pub name: String,
    pub description: String,
    /// Longest clip the model can produce, in seconds.
    pub max_length: u32,
}

impl From<&ModelInfo> for ModelResponse {
    fn from(model: &ModelInfo) -> Self {
        Self {
            id: model.id.to_owned(),
            name: model.name.to_owned(),
            description: model.description.to_owned(),
            max_length: model.max_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ModelListResponse {
    pub models: Vec<ModelResponse>,
}
