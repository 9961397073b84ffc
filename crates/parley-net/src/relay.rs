//! HTTP client for the offline relay.
//!
//! The relay speaks three plain endpoints under a base URL:
//!
//! - `GET  {base}/uniqueid.php` returns a base64 single-use challenge
//! - `GET  {base}/fetch.php?tag=..&sig=..` returns `FALSE` or a JSON array of
//!   `[payloadB64, pubkeyB64OrEmpty]` pairs
//! - `POST {base}/push.php` with form `tag, data, pk, push, fa` returns `OK`
//!
//! This module only speaks the wire protocol. Cooldown, signing and contact
//! bookkeeping live in the client.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parley_shared::constants::{RELAY_EMPTY, RELAY_OK};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected relay response: {0}")]
    BadResponse(String),

    #[error("Invalid JSON from relay: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 from relay: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Form fields of a push request, in wire order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushForm {
    /// Recipient identity tag.
    pub tag: String,
    /// Base64 of the encoded envelope.
    pub data: String,
    /// Base64 of the sender's public key, or empty.
    pub pk: String,
    /// Ask the relay to wake the recipient with a native push.
    pub push: bool,
    /// Sender identity tag.
    pub fa: String,
}

impl PushForm {
    pub fn fields(&self) -> [(&'static str, &str); 5] {
        [
            ("tag", self.tag.as_str()),
            ("data", self.data.as_str()),
            ("pk", self.pk.as_str()),
            ("push", if self.push { "True" } else { "False" }),
            ("fa", self.fa.as_str()),
        ]
    }
}

/// One queued message returned by the fetch endpoint, still base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchEntry {
    pub payload: String,
    /// Empty when the sender did not attach a public key.
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResponse {
    /// The relay answered `FALSE`.
    Empty,
    Entries(Vec<FetchEntry>),
}

#[derive(Clone)]
pub struct RelayHttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl RelayHttpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, RelayError> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(timeout)
            .build()?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    /// Fetch a fresh single-use challenge.
    pub async fn unique_id(&self) -> Result<Vec<u8>, RelayError> {
        let body = self.get_text(self.endpoint("uniqueid.php"), &[]).await?;
        Ok(BASE64.decode(body.trim())?)
    }

    /// Fetch the messages queued for `tag`, authenticated by a signature over
    /// the latest challenge.
    pub async fn fetch(&self, tag: &str, signature: &[u8]) -> Result<FetchResponse, RelayError> {
        let sig = BASE64.encode(signature);
        let body = self
            .get_text(self.endpoint("fetch.php"), &[("tag", tag), ("sig", &sig)])
            .await?;

        if body == RELAY_EMPTY {
            return Ok(FetchResponse::Empty);
        }
        parse_fetch_body(&body).map(FetchResponse::Entries)
    }

    /// Queue an envelope on the relay for an offline recipient. Only the
    /// literal body `OK` counts as accepted.
    pub async fn push(&self, form: &PushForm) -> Result<(), RelayError> {
        let resp = self
            .client
            .post(self.endpoint("push.php"))
            .form(&form.fields())
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if status.is_success() && body == RELAY_OK {
            debug!(recipient = %form.tag, "relay accepted push");
            Ok(())
        } else {
            Err(RelayError::BadResponse(format!("status={status} body={body:?}")))
        }
    }

    async fn get_text(&self, url: String, query: &[(&str, &str)]) -> Result<String, RelayError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::BadResponse(format!(
                "status={} body={:?}",
                status,
                resp.text().await.ok()
            )));
        }
        Ok(resp.text().await?)
    }
}

/// Parse the fetch body. Entries that are not pairs of strings are dropped
/// with a warning; the rest are kept.
fn parse_fetch_body(body: &str) -> Result<Vec<FetchEntry>, RelayError> {
    let raw: Vec<serde_json::Value> = serde_json::from_str(body)?;
    let mut entries = Vec::with_capacity(raw.len());
    for (index, value) in raw.into_iter().enumerate() {
        match serde_json::from_value::<(String, String)>(value) {
            Ok((payload, public_key)) => entries.push(FetchEntry {
                payload,
                public_key,
            }),
            Err(e) => warn!(index, error = %e, "skipping malformed relay entry"),
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Form, Query, State};
    use axum::routing::{get, post};
    use axum::Router;

    #[derive(Default)]
    struct Seen {
        fetch_query: Option<HashMap<String, String>>,
        push_form: Option<HashMap<String, String>>,
    }

    type Shared = Arc<Mutex<Seen>>;

    async fn spawn_relay(fetch_body: &'static str, push_body: &'static str) -> (String, Shared) {
        let seen = Shared::default();
        let app = Router::new()
            .route("/uniqueid.php", get(|| async { "AQID" }))
            .route(
                "/fetch.php",
                get(
                    move |State(seen): State<Shared>,
                          Query(q): Query<HashMap<String, String>>| async move {
                        seen.lock().unwrap().fetch_query = Some(q);
                        fetch_body
                    },
                ),
            )
            .route(
                "/push.php",
                post(
                    move |State(seen): State<Shared>,
                          Form(f): Form<HashMap<String, String>>| async move {
                        seen.lock().unwrap().push_form = Some(f);
                        push_body
                    },
                ),
            )
            .with_state(seen.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), seen)
    }

    fn client(base: &str) -> RelayHttpClient {
        RelayHttpClient::new(base, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn unique_id_is_base64_decoded() {
        let (base, _) = spawn_relay("FALSE", "OK").await;
        assert_eq!(client(&base).unique_id().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fetch_sends_tag_and_encoded_signature() {
        let (base, seen) = spawn_relay("FALSE", "OK").await;
        let resp = client(&base).fetch("abc", &[0xFB, 0xFF]).await.unwrap();

        assert_eq!(resp, FetchResponse::Empty);
        let query = seen.lock().unwrap().fetch_query.clone().unwrap();
        assert_eq!(query["tag"], "abc");
        assert_eq!(query["sig"], "+/8=");
    }

    #[tokio::test]
    async fn fetch_parses_entries_and_skips_malformed_ones() {
        let (base, _) = spawn_relay(r#"[["cGF5bG9hZDE=",""],[1,2],["cGF5bG9hZDI=","cHVia2V5Yg=="]]"#, "OK").await;
        let resp = client(&base).fetch("abc", &[1]).await.unwrap();

        assert_eq!(
            resp,
            FetchResponse::Entries(vec![
                FetchEntry {
                    payload: "cGF5bG9hZDE=".into(),
                    public_key: String::new(),
                },
                FetchEntry {
                    payload: "cGF5bG9hZDI=".into(),
                    public_key: "cHVia2V5Yg==".into(),
                },
            ])
        );
    }

    #[tokio::test]
    async fn fetch_rejects_non_json_body() {
        let (base, _) = spawn_relay("<html>oops</html>", "OK").await;
        assert!(matches!(
            client(&base).fetch("abc", &[1]).await,
            Err(RelayError::Json(_))
        ));
    }

    #[tokio::test]
    async fn push_posts_every_form_field() {
        let (base, seen) = spawn_relay("FALSE", "OK").await;
        let form = PushForm {
            tag: "to".into(),
            data: "ZGF0YQ==".into(),
            pk: String::new(),
            push: true,
            fa: "from".into(),
        };
        client(&base).push(&form).await.unwrap();

        let posted = seen.lock().unwrap().push_form.clone().unwrap();
        assert_eq!(posted["tag"], "to");
        assert_eq!(posted["data"], "ZGF0YQ==");
        assert_eq!(posted["pk"], "");
        assert_eq!(posted["push"], "True");
        assert_eq!(posted["fa"], "from");
    }

    #[tokio::test]
    async fn push_without_literal_ok_is_an_error() {
        for reply in ["ERROR", "OK\n", " OK", "ok"] {
            let (base, _) = spawn_relay("FALSE", reply).await;
            let form = PushForm {
                tag: "to".into(),
                data: String::new(),
                pk: String::new(),
                push: false,
                fa: "from".into(),
            };
            assert!(
                matches!(client(&base).push(&form).await, Err(RelayError::BadResponse(_))),
                "reply {reply:?} accepted"
            );
        }
    }
}
