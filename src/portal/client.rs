//! Portal client for one (portal, MAC) pair
//!
//! Emulates the MAG STB firmware closely enough that header-gating portals
//! accept the requests: MAG user agent, `X-User-Agent` model string, referer
//! matching the portal and the MAC carried as a cookie. Every call tries GET
//! first and retries once as POST. A challenge response (Cloudflare and
//! friends) gets one retry with a desktop-browser user agent, which only
//! helps against agent-based filtering: this client does not emulate a
//! browser TLS fingerprint or execute challenge scripts, so portals behind
//! an interactive challenge stay unreachable and are reported as such.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use reqwest::{Client, Method, Proxy, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::errors::{AppError, AppResult, PortalError};
use crate::models::Portal;
use crate::portal::endpoints;
use crate::portal::wire::{
    AccountInfoPayload, CreateLinkPayload, DataEnvelope, EpgPayload, HandshakePayload, JsEnvelope,
    OrderedListPayload, RawChannel, RawGenre, RawSeriesItem, RawVodItem,
};
use crate::proxy::Tunnel;

pub const STB_USER_AGENT: &str = "Mozilla/5.0 (QtEmbedded; U; Linux; C) AppleWebKit/533.3 \
     (KHTML, like Gecko) MAG200 stbapp ver: 2 rev: 250 Safari/533.3";
const STB_MODEL_HEADER: &str = "Model: MAG250; Link: WiFi";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Tokens are refreshed proactively on this interval
const TOKEN_TTL: Duration = Duration::from_secs(300);
const SHORT_TIMEOUT: Duration = Duration::from_secs(10);
const LONG_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_LIST_PAGES: usize = 10;

const CHALLENGE_MARKERS: &[&str] = &[
    "just a moment",
    "cf-chl",
    "challenge-platform",
    "attention required",
    "ddos-guard",
];

#[derive(Default)]
struct Session {
    endpoint: Option<String>,
    token: Option<String>,
    token_acquired: Option<Instant>,
}

/// Client bound to one portal and one MAC identity.
pub struct PortalClient {
    base: Url,
    origin: String,
    mac: String,
    client: Client,
    browser_client: Client,
    session: Mutex<Session>,
}

impl PortalClient {
    pub fn new(portal: &Portal, mac: &str, tunnel: Arc<Tunnel>) -> AppResult<Self> {
        let base = Url::parse(&portal.url)
            .map_err(|e| AppError::configuration(format!("portal '{}': bad URL: {e}", portal.id)))?;
        let origin = endpoints::origin_of(&base);

        let build = |user_agent: &str| -> AppResult<Client> {
            let mut builder = Client::builder()
                .user_agent(user_agent)
                .connect_timeout(CONNECT_TIMEOUT);
            if let Some(proxy_url) = tunnel.proxy_url() {
                builder = builder.proxy(Proxy::all(proxy_url).map_err(AppError::Http)?);
            }
            builder.build().map_err(AppError::Http)
        };

        Ok(Self {
            base,
            origin,
            mac: mac.to_string(),
            client: build(STB_USER_AGENT)?,
            browser_client: build(BROWSER_USER_AGENT)?,
            session: Mutex::new(Session::default()),
        })
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    /// Perform (or refresh) the handshake, returning the bearer token.
    pub async fn handshake(&self) -> Result<String, PortalError> {
        let mut session = self.session.lock().await;
        self.handshake_locked(&mut session).await
    }

    async fn handshake_locked(&self, session: &mut Session) -> Result<String, PortalError> {
        let endpoint = match &session.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => self.resolve_endpoint(session).await?,
        };
        match self.handshake_at(&endpoint).await? {
            Some(token) => {
                session.token = Some(token.clone());
                session.token_acquired = Some(Instant::now());
                Ok(token)
            }
            None => Err(PortalError::HandshakeFailed {
                mac: self.mac.clone(),
                reason: "portal returned no token".into(),
            }),
        }
    }

    /// Probe candidate endpoints until one completes a handshake; the winner
    /// is cached for the rest of this client's life.
    async fn resolve_endpoint(&self, session: &mut Session) -> Result<String, PortalError> {
        for candidate in endpoints::candidate_endpoints(&self.base) {
            debug!(endpoint = %candidate, mac = %self.mac, "probing portal endpoint");
            if let Ok(Some(_)) = self.handshake_at(&candidate).await {
                session.endpoint = Some(candidate.clone());
                return Ok(candidate);
            }
        }
        // Dynamic detection: the client-side JS betrays which handler exists.
        for (probe, handler) in endpoints::XPCOM_PROBES {
            let probe_url = format!("{}{probe}", self.origin);
            let found = self
                .client
                .get(&probe_url)
                .header("Referer", format!("{}/", self.origin))
                .timeout(SHORT_TIMEOUT)
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if !found {
                continue;
            }
            let candidate = format!("{}{handler}", self.origin);
            debug!(endpoint = %candidate, probe = %probe_url, "detected endpoint via xpcom probe");
            if let Ok(Some(_)) = self.handshake_at(&candidate).await {
                session.endpoint = Some(candidate.clone());
                return Ok(candidate);
            }
        }
        Err(PortalError::AllEndpointsExhausted {
            url: self.base.to_string(),
        })
    }

    async fn handshake_at(&self, endpoint: &str) -> Result<Option<String>, PortalError> {
        let params = [
            ("type", "stb"),
            ("action", "handshake"),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.call(endpoint, &params, None, SHORT_TIMEOUT).await?;
        let payload: JsEnvelope<HandshakePayload> =
            serde_json::from_value(value).map_err(|e| PortalError::MalformedResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })?;
        Ok(payload.js.token.filter(|t| !t.is_empty()))
    }

    /// Cached token when fresh, transparent re-handshake when stale.
    async fn ensure_session(&self) -> Result<(String, String), PortalError> {
        let mut session = self.session.lock().await;
        let fresh = session
            .token_acquired
            .map(|at| at.elapsed() < TOKEN_TTL)
            .unwrap_or(false);
        if let (true, Some(token), Some(endpoint)) =
            (fresh, session.token.clone(), session.endpoint.clone())
        {
            return Ok((endpoint, token));
        }
        let token = self.handshake_locked(&mut session).await?;
        let endpoint = session.endpoint.clone().expect("endpoint set by handshake");
        Ok((endpoint, token))
    }

    /// Authenticated portal action with one transparent re-handshake.
    async fn action(
        &self,
        params: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<serde_json::Value, PortalError> {
        let (endpoint, token) = self.ensure_session().await?;
        match self.call(&endpoint, params, Some(&token), timeout).await {
            Err(PortalError::AuthExpired) => {
                debug!(mac = %self.mac, "token rejected, re-handshaking once");
                let token = self.handshake().await?;
                self.call(&endpoint, params, Some(&token), timeout).await
            }
            other => other,
        }
    }

    /// One logical call: GET, then POST on failure, with a browser-client
    /// retry when the portal answers with an anti-bot challenge.
    async fn call(
        &self,
        endpoint: &str,
        params: &[(&str, &str)],
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<serde_json::Value, PortalError> {
        let get = self
            .attempt(&self.client, Method::GET, endpoint, params, token, timeout)
            .await;
        match get {
            Ok(value) => Ok(value),
            Err(PortalError::AuthExpired) => Err(PortalError::AuthExpired),
            Err(first) => {
                debug!(endpoint, error = %first, "GET failed, retrying as POST");
                match self
                    .attempt(&self.client, Method::POST, endpoint, params, token, timeout)
                    .await
                {
                    Ok(value) => Ok(value),
                    Err(PortalError::AuthExpired) => Err(PortalError::AuthExpired),
                    Err(_) => Err(first),
                }
            }
        }
    }

    async fn attempt(
        &self,
        client: &Client,
        method: Method,
        endpoint: &str,
        params: &[(&str, &str)],
        token: Option<&str>,
        timeout: Duration,
    ) -> Result<serde_json::Value, PortalError> {
        let mut request = client
            .request(method.clone(), endpoint)
            .header("Accept", "*/*")
            .header("Referer", format!("{}/", self.origin))
            .header("X-User-Agent", STB_MODEL_HEADER)
            .header(
                "Cookie",
                format!(
                    "mac={}; stb_lang=en; timezone={}",
                    urlencoding::encode(&self.mac),
                    urlencoding::encode("Europe/London")
                ),
            )
            .timeout(timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request = if method == Method::GET {
            request.query(params)
        } else {
            request.form(params)
        };

        let response =
            request
                .send()
                .await
                .map_err(|e| PortalError::PortalUnreachable {
                    url: endpoint.to_string(),
                    reason: e.to_string(),
                })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PortalError::PortalUnreachable {
                url: endpoint.to_string(),
                reason: e.to_string(),
            })?;

        if is_challenge(status, &body) {
            // Same attempt once more with the browser user agent; enough
            // for agent-gating, not for interactive challenges.
            if std::ptr::eq(client, &self.client) {
                warn!(endpoint, "challenge detected, retrying with browser user agent");
                return Box::pin(self.attempt(
                    &self.browser_client,
                    method,
                    endpoint,
                    params,
                    token,
                    timeout,
                ))
                .await;
            }
            return Err(PortalError::PortalUnreachable {
                url: endpoint.to_string(),
                reason: format!("challenge not passed (status {status})"),
            });
        }
        if is_auth_failure(status, &body) {
            return Err(PortalError::AuthExpired);
        }
        if !status.is_success() {
            return Err(PortalError::MalformedResponse {
                endpoint: endpoint.to_string(),
                reason: format!("status {status}"),
            });
        }
        serde_json::from_str(&body).map_err(|e| PortalError::MalformedResponse {
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })
    }

    fn parse<T: serde::de::DeserializeOwned>(
        &self,
        value: serde_json::Value,
        context: &str,
    ) -> Result<T, PortalError> {
        serde_json::from_value(value).map_err(|e| PortalError::MalformedResponse {
            endpoint: context.to_string(),
            reason: e.to_string(),
        })
    }

    pub async fn get_profile(&self) -> Result<serde_json::Value, PortalError> {
        let params = [
            ("type", "stb"),
            ("action", "get_profile"),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, SHORT_TIMEOUT).await?;
        let envelope: JsEnvelope<serde_json::Value> = self.parse(value, "get_profile")?;
        Ok(envelope.js)
    }

    /// Account expiry as reported by `get_main_info`; portals put the date
    /// in the free-text `phone` field.
    pub async fn get_account_expiry(&self) -> Result<Option<NaiveDate>, PortalError> {
        let params = [
            ("type", "account_info"),
            ("action", "get_main_info"),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, SHORT_TIMEOUT).await?;
        let envelope: JsEnvelope<AccountInfoPayload> = self.parse(value, "get_main_info")?;
        Ok(envelope.js.phone.as_deref().and_then(parse_expiry_date))
    }

    pub async fn list_channels(&self) -> Result<Vec<RawChannel>, PortalError> {
        let params = [
            ("type", "itv"),
            ("action", "get_all_channels"),
            ("force_ch_link_check", ""),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, LONG_TIMEOUT).await?;
        let envelope: JsEnvelope<DataEnvelope<Vec<RawChannel>>> =
            self.parse(value, "get_all_channels")?;
        Ok(envelope.js.data.unwrap_or_default())
    }

    pub async fn list_genres(&self) -> Result<Vec<RawGenre>, PortalError> {
        let params = [
            ("type", "itv"),
            ("action", "get_genres"),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, SHORT_TIMEOUT).await?;
        let envelope: JsEnvelope<Vec<RawGenre>> = self.parse(value, "get_genres")?;
        Ok(envelope.js)
    }

    /// Resolve the playable link for a channel command. Portal-relative
    /// commands need a `create_link` round trip; direct commands already
    /// carry the URL as their last token.
    pub async fn resolve_stream_link(&self, cmd: &str) -> Result<String, PortalError> {
        if !needs_create_link(cmd) {
            return extract_link(cmd).ok_or_else(|| PortalError::MalformedResponse {
                endpoint: "create_link".into(),
                reason: format!("no URL in command '{cmd}'"),
            });
        }
        let params = [
            ("type", "itv"),
            ("action", "create_link"),
            ("cmd", cmd),
            ("series", "0"),
            ("forced_storage", "false"),
            ("disable_ad", "false"),
            ("download", "false"),
            ("force_ch_link_check", "false"),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, SHORT_TIMEOUT).await?;
        let envelope: JsEnvelope<CreateLinkPayload> = self.parse(value, "create_link")?;
        extract_link(&envelope.js.cmd).ok_or_else(|| PortalError::MalformedResponse {
            endpoint: "create_link".into(),
            reason: format!("no URL in response command '{}'", envelope.js.cmd),
        })
    }

    /// Programme data for the next `period_hours`, keyed by channel id.
    pub async fn get_epg(&self, period_hours: u32) -> Result<EpgPayload, PortalError> {
        let period = period_hours.to_string();
        let params = [
            ("type", "itv"),
            ("action", "get_epg_info"),
            ("period", period.as_str()),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, LONG_TIMEOUT).await?;
        let envelope: JsEnvelope<DataEnvelope<EpgPayload>> = self.parse(value, "get_epg_info")?;
        Ok(envelope.js.data.unwrap_or_default())
    }

    pub async fn list_vod_categories(&self) -> Result<Vec<RawGenre>, PortalError> {
        let params = [
            ("type", "vod"),
            ("action", "get_categories"),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, SHORT_TIMEOUT).await?;
        let envelope: JsEnvelope<Vec<RawGenre>> = self.parse(value, "vod get_categories")?;
        Ok(envelope.js)
    }

    pub async fn list_vod_items(&self, category_id: &str) -> Result<Vec<RawVodItem>, PortalError> {
        self.fetch_ordered_list("vod", Some(category_id)).await
    }

    pub async fn list_series_categories(&self) -> Result<Vec<RawGenre>, PortalError> {
        let params = [
            ("type", "series"),
            ("action", "get_categories"),
            ("JsHttpRequest", "1-xml"),
        ];
        let value = self.action(&params, SHORT_TIMEOUT).await?;
        let envelope: JsEnvelope<Vec<RawGenre>> = self.parse(value, "series get_categories")?;
        Ok(envelope.js)
    }

    pub async fn list_series(&self) -> Result<Vec<RawSeriesItem>, PortalError> {
        self.fetch_ordered_list("series", None).await
    }

    async fn fetch_ordered_list<T: serde::de::DeserializeOwned>(
        &self,
        kind: &str,
        category_id: Option<&str>,
    ) -> Result<Vec<T>, PortalError> {
        let mut items: Vec<T> = Vec::new();
        for page in 1..=MAX_LIST_PAGES {
            let page_str = page.to_string();
            let mut params = vec![
                ("type", kind),
                ("action", "get_ordered_list"),
                ("p", page_str.as_str()),
                ("JsHttpRequest", "1-xml"),
            ];
            if let Some(category) = category_id {
                params.push(("category", category));
            }
            let value = self.action(&params, LONG_TIMEOUT).await?;
            let envelope: JsEnvelope<OrderedListPayload<T>> =
                self.parse(value, "get_ordered_list")?;
            let page_len = envelope.js.data.len();
            items.extend(envelope.js.data);
            let done = match envelope.js.total_items {
                Some(total) => items.len() as i64 >= total,
                None => page_len == 0,
            };
            if done || page_len == 0 {
                break;
            }
        }
        Ok(items)
    }
}

/// Whether the channel command points back at the portal itself and needs a
/// `create_link` exchange to become playable.
pub fn needs_create_link(cmd: &str) -> bool {
    cmd.contains("http://localhost/")
}

/// Last whitespace-separated token of a stalker command, e.g.
/// `"ffmpeg http://host/stream"` -> `"http://host/stream"`.
pub fn extract_link(cmd: &str) -> Option<String> {
    cmd.split_whitespace()
        .last()
        .filter(|tok| !tok.is_empty())
        .map(str::to_string)
}

fn is_challenge(status: StatusCode, body: &str) -> bool {
    if status != StatusCode::FORBIDDEN && status != StatusCode::SERVICE_UNAVAILABLE {
        return false;
    }
    let lowered = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lowered.contains(m))
}

fn is_auth_failure(status: StatusCode, body: &str) -> bool {
    status == StatusCode::UNAUTHORIZED || body.contains("Authorization failed")
}

/// Portals report expiry in several date spellings.
fn parse_expiry_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    for format in ["%B %e, %Y", "%b %e, %Y", "%Y-%m-%d", "%d.%m.%Y", "%d/%m/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some(date);
        }
    }
    None
}
