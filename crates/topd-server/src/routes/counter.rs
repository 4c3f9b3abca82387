use std::sync::Arc;

use axum::{
    extract::{OriginalUri, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;

use topd_core::{
    history::RawVisitEvent,
    site::{Site, SiteId},
    visitor::{new_session_token, referrer_scheme},
};

use crate::{error::AppError, history::HistoryError, state::AppState};

const TRANSPARENT_GIF: &[u8] = &[
    71, 73, 70, 56, 57, 97, 1, 0, 1, 0, 128, 0, 0, 0, 0, 0, 255, 255, 255, 33, 249, 4, 1, 0, 0, 0,
    0, 44, 0, 0, 0, 0, 1, 0, 1, 0, 0, 2, 2, 68, 1, 0, 59,
];
pub const SESSION_COOKIE: &str = "sess";
const SESSION_COOKIE_YEARS: i64 = 15;

#[derive(Debug, Default, Deserialize)]
pub struct CounterQuery {
    pub id: Option<String>,
    /// Page the counter is embedded on.
    pub p: Option<String>,
    #[serde(rename = "ref")]
    pub referrer: Option<String>,
    /// Set on the redirect target so a client that refuses cookies is not
    /// redirected forever.
    pub fw: Option<String>,
}

/// `GET /top/?id=<site>&p=<page>&ref=<referrer>`: count a visit and return
/// the counter image.
///
/// ## Flow
/// 1. Unknown site: placeholder image, nothing counted.
/// 2. No `sess` cookie and no `fw`: `302` back to the same URL with `fw=1`
///    and a fresh `sess` cookie, so the counted request carries a session.
/// 3. Otherwise: queue the visit for history, dedup the session, count a hit
///    (and a host for a new session) unless the user agent is a known bot.
///    A saturated history queue answers `503` with `Retry-After` and counts
///    nothing; any other history failure is logged and the visit still counts.
///    A request with no session token at all counts a hit but never a host.
///
/// Image rendering is out of scope here: the body is a 1x1 GIF, and sites
/// with digits enabled get the counters in `X-Counter-Hits` /
/// `X-Counter-Hosts`.
#[tracing::instrument(skip(state, headers, query))]
pub async fn counter(
    State(state): State<Arc<AppState>>,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<CounterQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let Some((site_id, site)) = query
        .id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<SiteId>().ok())
        .and_then(|id| state.sites.get(id).map(|site| (id, site)))
    else {
        return Ok(counter_image(None));
    };

    let cookie_session = cookie_value(&headers, SESSION_COOKIE);
    let user_agent = header_str(&headers, header::USER_AGENT.as_str());
    let client_ip = header_str(&headers, "x-real-ip");

    if cookie_session.is_none() && query.fw.as_deref().map_or(true, str::is_empty) {
        let referer = header_str(&headers, header::REFERER.as_str());
        let path_and_query = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/top/");
        let separator = if path_and_query.contains('?') { '&' } else { '?' };
        let location = format!(
            "{}://{}{}{}fw=1",
            referrer_scheme(&referer),
            state.config.host,
            path_and_query,
            separator
        );
        let token = new_session_token(&client_ip, &user_agent);
        return redirect_with_session(&location, &token, &state.config.cookie_domain);
    }

    let session_token = cookie_session.unwrap_or_else(|| client_ip.clone());

    let event = RawVisitEvent {
        page: query.p.unwrap_or_default(),
        referrer: query.referrer.unwrap_or_default(),
        geo_tag: header_str(&headers, "x-geo"),
        session_token: session_token.clone(),
        user_agent: user_agent.clone(),
        source_ip: client_ip.parse().ok(),
        site_id,
    };
    match state.queue.try_write(event) {
        Ok(()) => {}
        Err(HistoryError::QueueFull) => {
            tracing::warn!(site_id, "History queue full, visit rejected");
            return Err(AppError::QueueFull);
        }
        Err(e) => {
            // History is best effort; the visit is still counted.
            tracing::warn!(site_id, error = %e, "Visit not queued for history");
        }
    }

    // Without a cookie or X-Real-IP every visitor would share one token.
    let seen = if session_token.is_empty() {
        tracing::debug!(site_id, "No session token, host not counted");
        true
    } else {
        state.sessions.check_and_register(site_id, &session_token)
    };
    let site = if state.bots.is_bot(&user_agent) {
        tracing::debug!(site_id, "Bot user agent, not counted");
        site
    } else {
        state.sites.increment(site_id, !seen, true).unwrap_or(site)
    };

    Ok(counter_image(Some(&site)))
}

fn counter_image(site: Option<&Site>) -> Response {
    let mut response = Response::new(axum::body::Body::from(TRANSPARENT_GIF.to_vec()));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/gif"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    if let Some(site) = site.filter(|s| s.show_digits) {
        headers.insert("x-counter-hits", HeaderValue::from(site.hits));
        headers.insert("x-counter-hosts", HeaderValue::from(site.unique_hosts));
    }
    response
}

fn redirect_with_session(location: &str, token: &str, domain: &str) -> Result<Response, AppError> {
    let expires = Utc::now() + chrono::Duration::days(365 * SESSION_COOKIE_YEARS);
    let cookie = format!(
        "{SESSION_COOKIE}={token}; Path=/; Domain={domain}; Expires={}",
        expires.format("%a, %d %b %Y %H:%M:%S GMT")
    );

    let mut response = Response::new(axum::body::Body::empty());
    *response.status_mut() = StatusCode::FOUND;
    let headers = response.headers_mut();
    headers.insert(
        header::LOCATION,
        HeaderValue::from_str(location)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bad redirect location: {e}")))?,
    );
    headers.insert(
        header::SET_COOKIE,
        HeaderValue::from_str(&cookie)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("bad session cookie: {e}")))?,
    );
    Ok(response)
}

fn header_str(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Value of cookie `name` from the `Cookie` header(s), if present and non-empty.
fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
