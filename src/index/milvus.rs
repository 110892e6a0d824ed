use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{IndexConnector, LoadState, SearchHit, SearchRequest, VectorIndex};
use crate::error::{ConfigError, IndexError, IndexResult};

pub struct MilvusRestIndex {
    client: Client,
    base_url: String,
}

impl MilvusRestIndex {
    pub fn new(uri: &str, token: &str, timeout: Duration) -> IndexResult<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
            ConfigError::Invalid {
                key: "index.token",
                message: e.to_string(),
            }
        })?;
        headers.insert(AUTHORIZATION, auth);

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;
        Ok(Self {
            client,
            base_url: uri.trim_end_matches('/').to_string(),
        })
    }

    fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> IndexResult<T> {
        let url = format!("{}/v2/vectordb/{path}", self.base_url);
        tracing::debug!(url = %url, "index request");
        let response = self.client.post(&url).json(body).send()?;
        let status = response.status();
        let text = response.text()?;
        if !status.is_success() {
            return Err(IndexError::Api {
                code: i64::from(status.as_u16()),
                message: text,
            });
        }
        parse_envelope(&text)
    }
}

fn parse_envelope<T: DeserializeOwned>(text: &str) -> IndexResult<T> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| IndexError::Malformed(e.to_string()))?;
    if envelope.code != 0 {
        return Err(IndexError::Api {
            code: envelope.code,
            message: envelope.message.unwrap_or_default(),
        });
    }
    serde_json::from_value(envelope.data.unwrap_or(Value::Null))
        .map_err(|e| IndexError::Malformed(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CollectionRequest<'a> {
    collection_name: &'a str,
}

#[derive(Debug, Deserialize)]
struct HasData {
    #[serde(default)]
    has: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStateData {
    #[serde(default)]
    load_state: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody<'a> {
    collection_name: &'a str,
    data: [&'a [f32]; 1],
    anns_field: &'a str,
    limit: usize,
    output_fields: &'a [String],
    search_params: SearchParams<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchParams<'a> {
    metric_type: &'a str,
    params: LevelParams,
}

#[derive(Debug, Serialize)]
struct LevelParams {
    level: u32,
}

fn parse_load_state(s: &str) -> LoadState {
    match s {
        "LoadStateLoaded" => LoadState::Loaded,
        "LoadStateLoading" => LoadState::Loading,
        "LoadStateNotExist" => LoadState::NotExist,
        _ => LoadState::NotLoad,
    }
}

/// Split a raw hit object into its distance and entity fields.
fn hit_from_object(mut obj: Map<String, Value>) -> SearchHit {
    let distance = obj
        .remove("distance")
        .and_then(|v| v.as_f64())
        .unwrap_or_default() as f32;
    obj.remove("id");
    obj.remove("primary_key");
    SearchHit {
        distance,
        entity: if obj.is_empty() { None } else { Some(obj) },
    }
}

impl VectorIndex for MilvusRestIndex {
    fn has_collection(&self, name: &str) -> IndexResult<bool> {
        let data: HasData = self.post(
            "collections/has",
            &CollectionRequest {
                collection_name: name,
            },
        )?;
        Ok(data.has)
    }

    fn load(&self, name: &str) -> IndexResult<()> {
        let _: Value = self.post(
            "collections/load",
            &CollectionRequest {
                collection_name: name,
            },
        )?;
        Ok(())
    }

    fn load_state(&self, name: &str) -> IndexResult<LoadState> {
        let data: LoadStateData = self.post(
            "collections/get_load_state",
            &CollectionRequest {
                collection_name: name,
            },
        )?;
        Ok(parse_load_state(&data.load_state))
    }

    fn search(&self, request: &SearchRequest) -> IndexResult<Vec<SearchHit>> {
        let body = SearchBody {
            collection_name: &request.collection,
            data: [&request.vector],
            anns_field: &request.anns_field,
            limit: request.limit,
            output_fields: &request.output_fields,
            search_params: SearchParams {
                metric_type: &request.metric_type,
                params: LevelParams {
                    level: request.level,
                },
            },
        };
        let rows: Option<Vec<Map<String, Value>>> = self.post("entities/search", &body)?;
        Ok(rows
            .unwrap_or_default()
            .into_iter()
            .map(hit_from_object)
            .collect())
    }
}

/// Opens [`MilvusRestIndex`] connections with a fixed request timeout.
pub struct MilvusConnector {
    pub request_timeout: Duration,
}

impl IndexConnector for MilvusConnector {
    fn connect(&self, uri: &str, token: &str) -> IndexResult<Arc<dyn VectorIndex>> {
        Ok(Arc::new(MilvusRestIndex::new(
            uri,
            token,
            self.request_timeout,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_body_matches_rest_schema() {
        let vector = vec![0.5_f32, 0.25];
        let fields = vec!["francais".to_string(), "breton".to_string()];
        let body = SearchBody {
            collection_name: "traductions_francais_breton",
            data: [&vector],
            anns_field: "embedding",
            limit: 3,
            output_fields: &fields,
            search_params: SearchParams {
                metric_type: "COSINE",
                params: LevelParams { level: 2 },
            },
        };
        let json = serde_json::to_value(&body).expect("serialize");
        assert_eq!(
            json,
            serde_json::json!({
                "collectionName": "traductions_francais_breton",
                "data": [[0.5, 0.25]],
                "annsField": "embedding",
                "limit": 3,
                "outputFields": ["francais", "breton"],
                "searchParams": {"metricType": "COSINE", "params": {"level": 2}}
            })
        );
    }

    #[test]
    fn parses_search_hits_in_order() {
        let text = r#"{"code":0,"data":[
            {"id":7,"distance":0.93,"francais":"A","breton":"a"},
            {"id":3,"distance":0.71,"francais":"B"},
            {"id":9,"distance":0.40}
        ]}"#;
        let rows: Option<Vec<Map<String, Value>>> = parse_envelope(text).expect("parse");
        let hits: Vec<SearchHit> = rows.unwrap_or_default().into_iter().map(hit_from_object).collect();
        assert_eq!(hits.len(), 3);
        assert!((hits[0].distance - 0.93).abs() < 1e-6);
        assert_eq!(hits[0].field("francais"), Some("A"));
        assert_eq!(hits[1].field("breton"), None);
        assert!(hits[2].entity.is_none());
    }

    #[test]
    fn non_zero_code_is_an_error() {
        let text = r#"{"code":1800,"message":"user hasn't authenticated"}"#;
        let err = parse_envelope::<Value>(text).expect_err("api error");
        match err {
            IndexError::Api { code, message } => {
                assert_eq!(code, 1800);
                assert!(message.contains("authenticated"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn parses_load_state_and_has() {
        let state: LoadStateData = parse_envelope(
            r#"{"code":0,"data":{"loadProgress":100,"loadState":"LoadStateLoaded"}}"#,
        )
        .expect("parse");
        assert_eq!(parse_load_state(&state.load_state), LoadState::Loaded);
        assert_eq!(parse_load_state("LoadStateLoading"), LoadState::Loading);
        assert_eq!(parse_load_state("LoadStateNotLoad"), LoadState::NotLoad);

        let has: HasData = parse_envelope(r#"{"code":0,"data":{"has":true}}"#).expect("parse");
        assert!(has.has);
    }

    #[test]
    fn garbage_response_is_malformed() {
        assert!(matches!(
            parse_envelope::<Value>("<html>"),
            Err(IndexError::Malformed(_))
        ));
    }
}
