//! Request and response shapes of the recommendation endpoint.

use serde::{Deserialize, Serialize};
use sources::RetrievalJob;
use std::collections::BTreeMap;
use store::{BikeId, CatalogBike, Profile, UserId};

/// Paging and optional profile override
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationRequest {
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
    /// Skip the profile lookup and rank for this profile instead
    #[serde(default)]
    pub profile: Option<Profile>,
}

impl RecommendationRequest {
    pub fn page(limit: usize, offset: usize) -> Self {
        Self {
            limit: Some(limit),
            offset: Some(offset),
            profile: None,
        }
    }
}

/// Who is asking
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            session_id: None,
        }
    }

    pub fn session(session_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            session_id: Some(session_id.into()),
        }
    }
}

/// One recommended bike, without internal scores
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BikeRecommendation {
    pub id: BikeId,
    pub name: String,
    pub brand: String,
    pub model: Option<String>,
    pub discipline: Option<String>,
    pub category: Option<String>,
    pub price: f64,
    pub rank: f64,
    pub image: Option<String>,
    pub main_image: Option<String>,
    pub images: Vec<String>,
    pub retrieved_by: RetrievalJob,
}

impl BikeRecommendation {
    pub fn from_bike(bike: CatalogBike, retrieved_by: RetrievalJob) -> Self {
        let image = pick_valid_image(bike.main_image.as_deref(), &bike.images);
        Self {
            id: bike.id,
            name: bike.name,
            brand: bike.brand,
            model: bike.model,
            discipline: bike.discipline,
            category: bike.category,
            price: bike.price,
            rank: bike.rank,
            main_image: image.clone(),
            image,
            images: bike.images,
            retrieved_by,
        }
    }
}

/// How the candidate pool was assembled
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrievalSummary {
    pub candidate_count: usize,
    pub strategy: String,
    pub top_disciplines: Vec<String>,
    pub top_brands: Vec<String>,
    pub budget_cluster: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecommendationResponse {
    pub success: bool,
    pub bikes: Vec<BikeRecommendation>,
    pub profile_used: Profile,
    pub experiments: BTreeMap<String, String>,
    pub retrieval: RetrievalSummary,
}

fn is_http(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// The main image when it is an http(s) URL, else the first http(s) gallery
/// image, else whatever main image there is
pub fn pick_valid_image(main_image: Option<&str>, images: &[String]) -> Option<String> {
    let main = main_image.map(str::trim).filter(|m| !m.is_empty());
    if let Some(url) = main.filter(|m| is_http(m)) {
        return Some(url.to_string());
    }
    images
        .iter()
        .map(|image| image.trim())
        .find(|image| is_http(image))
        .or(main)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pick_valid_image() {
        let gallery = vec!["/local/a.jpg".to_string(), " https://cdn/b.jpg".to_string()];
        assert_eq!(
            pick_valid_image(Some("https://cdn/main.jpg"), &gallery).as_deref(),
            Some("https://cdn/main.jpg")
        );
        assert_eq!(pick_valid_image(Some("/local/main.jpg"), &gallery).as_deref(), Some("https://cdn/b.jpg"));
        assert_eq!(pick_valid_image(Some("/local/main.jpg"), &[]).as_deref(), Some("/local/main.jpg"));
        assert_eq!(pick_valid_image(None, &[]), None);
        assert_eq!(pick_valid_image(Some("  "), &["ftp://x".to_string()]), None);
    }

    #[test]
    fn test_request_decodes_camel_case() {
        let request: RecommendationRequest = serde_json::from_str(r#"{"limit": 5, "offset": 10}"#).unwrap();
        assert_eq!(request, RecommendationRequest::page(5, 10));
        let ctx: RequestContext = serde_json::from_str(r#"{"userId": 4, "sessionId": "s"}"#).unwrap();
        assert_eq!(ctx.user_id, Some(4));
    }
}
