//! HTTP recommender: delegates to an external reasoning service.
//!
//! POSTs `{"parameters": ...}` as JSON and expects a `Recommendation` back.
//! The service may wrap it as `{"recommendation": ...}`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::{Recommendation, Recommender, RecommenderError};
use crate::params::AnalysisParameters;

pub struct HttpRecommender {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpRecommender {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self, RecommenderError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RecommenderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl Recommender for HttpRecommender {
    fn name(&self) -> &str {
        "http"
    }

    async fn recommend(&self, params: &AnalysisParameters) -> Result<Recommendation, RecommenderError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "parameters": params }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RecommenderError::Timeout(Duration::ZERO)
            } else {
                RecommenderError::Transport(e.to_string())
            }
        })?;

        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| RecommenderError::Transport(e.to_string()))?;
        if !(200..300).contains(&status) {
            return Err(RecommenderError::Status {
                status,
                body: body.chars().take(500).collect(),
            });
        }
        parse_recommendation(&body)
    }
}

fn parse_recommendation(body: &str) -> Result<Recommendation, RecommenderError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| RecommenderError::InvalidResponse(e.to_string()))?;
    let inner = match value.get("recommendation") {
        Some(inner) => inner.clone(),
        None => value,
    };
    serde_json::from_value(inner).map_err(|e| RecommenderError::InvalidResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_and_wrapped() {
        let bare = r#"{"selected_model":{"provider":"openai","model":"gpt-4o"},
            "expected_metrics":{"latency_ms":1200,"cost_per_1k":0.006,"quality_score":8.1,"success_rate":0.97}}"#;
        let rec = parse_recommendation(bare).unwrap();
        assert_eq!(rec.selected_model.model, "gpt-4o");
        assert_eq!(rec.selected_model.max_tokens, 4_096);
        assert!(rec.fallback_models.is_empty());

        let wrapped = format!(r#"{{"recommendation":{bare}}}"#);
        assert_eq!(parse_recommendation(&wrapped).unwrap(), rec);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_recommendation("not json"),
            Err(RecommenderError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_recommendation(r#"{"selected_model":{}}"#),
            Err(RecommenderError::InvalidResponse(_))
        ));
    }
}
