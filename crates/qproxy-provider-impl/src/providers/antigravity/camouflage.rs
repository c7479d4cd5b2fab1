//! Background traffic that mirrors the official client's observable network
//! footprint: warmup, heartbeat, telemetry, trajectory, feature-flag (unleash)
//! polling, and version checks. None of it affects real request handling —
//! failures here are logged at `debug` and otherwise swallowed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::{Rng, RngCore};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use qproxy_provider_core::{Op, UpstreamCtx};

use super::super::http_client::{self, SharedClientKind};

const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);
const HEARTBEAT_JITTER_MS: u64 = 50;
const HEARTBEAT_IDLE_GATE: Duration = Duration::from_secs(180);
const UNLEASH_INTERVAL: Duration = Duration::from_secs(60);
const UNLEASH_JITTER_SECS: u64 = 5;
const VERSION_CHECK_INTERVAL: Duration = Duration::from_secs(3600);
const VERSION_CHECK_DEBOUNCE: Duration = Duration::from_secs(30);
const WARMUP_JITTER_MIN_MS: u64 = 50;
const WARMUP_JITTER_MAX_MS: u64 = 200;

/// Per-account identity shared by every camouflage task. `access_token` and
/// `user_agent` are hot-swappable so a token refresh or a version-fetcher
/// mismatch can update them without restarting the running timers.
struct AccountIdentity {
    account_id: i64,
    base_url: String,
    access_token: RwLock<String>,
    user_agent: RwLock<String>,
    connection_id: String,
    started_at_nanos: u128,
    unleash_etag: RwLock<Option<String>>,
    last_activity: RwLock<Instant>,
}

pub struct CamouflageHandle {
    identity: Arc<AccountIdentity>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct CamouflageParams {
    pub account_id: i64,
    pub base_url: String,
    pub access_token: String,
    pub user_agent: String,
    pub outbound_proxy: Option<String>,
}

impl CamouflageHandle {
    /// Records real user traffic so the heartbeat's idle gate knows to keep
    /// sending; called from the request path when wiring this in.
    pub async fn note_activity(&self) {
        *self.identity.last_activity.write().await = Instant::now();
    }

    pub async fn update_access_token(&self, token: String) {
        *self.identity.access_token.write().await = token;
    }

    /// Fire-and-forget per-request telemetry event. Never awaited by the
    /// caller for its result; errors are logged and dropped.
    pub fn fire_telemetry(&self, request_id: String, model: String, proxy: Option<String>) {
        let identity = self.identity.clone();
        tokio::spawn(async move {
            if let Err(err) = send_telemetry(&identity, &request_id, &model, proxy).await {
                tracing::debug!(account_id = identity.account_id, error = %err, "telemetry camouflage failed");
            }
        });
    }

    /// Fire-and-forget per-request trajectory trace.
    pub fn fire_trajectory(&self, request_id: String, model: String, proxy: Option<String>) {
        let identity = self.identity.clone();
        tokio::spawn(async move {
            if let Err(err) = send_trajectory(&identity, &request_id, &model, proxy).await {
                tracing::debug!(account_id = identity.account_id, error = %err, "trajectory camouflage failed");
            }
        });
    }

    pub fn stop(self) {
        for task in self.tasks {
            task.abort();
        }
    }
}

pub fn spawn(params: CamouflageParams) -> CamouflageHandle {
    let identity = Arc::new(AccountIdentity {
        account_id: params.account_id,
        base_url: params.base_url.trim_end_matches('/').to_string(),
        access_token: RwLock::new(params.access_token),
        user_agent: RwLock::new(params.user_agent),
        connection_id: random_connection_id(),
        started_at_nanos: now_nanos(),
        unleash_etag: RwLock::new(None),
        last_activity: RwLock::new(Instant::now()),
    });

    let mut tasks = Vec::new();

    {
        let identity = identity.clone();
        let proxy = params.outbound_proxy.clone();
        tasks.push(tokio::spawn(async move {
            run_warmup(&identity, proxy).await;
        }));
    }
    {
        let identity = identity.clone();
        let proxy = params.outbound_proxy.clone();
        tasks.push(tokio::spawn(run_heartbeat(identity, proxy)));
    }
    {
        let identity = identity.clone();
        let proxy = params.outbound_proxy.clone();
        tasks.push(tokio::spawn(run_unleash(identity, proxy)));
    }
    {
        let identity = identity.clone();
        let proxy = params.outbound_proxy;
        tasks.push(tokio::spawn(run_version_fetcher(identity, proxy)));
    }

    CamouflageHandle { identity, tasks }
}

async fn client(proxy: Option<String>) -> Result<wreq::Client, String> {
    let ctx = UpstreamCtx {
        trace_id: None,
        user_id: None,
        user_key_id: None,
        user_agent: None,
        outbound_proxy: proxy,
        provider: super::PROVIDER_NAME.to_string(),
        credential_id: None,
        op: Op::ModelList,
        internal: true,
        attempt_no: 0,
    };
    http_client::client_for_ctx(&ctx, SharedClientKind::Global).map_err(|err| err.to_string())
}

async fn post_internal(
    identity: &AccountIdentity,
    method: &str,
    body: serde_json::Value,
    proxy: Option<String>,
    extra_headers: &[(&str, String)],
) -> Result<wreq::Response, String> {
    let client = client(proxy).await?;
    let url = format!("{}/v1internal:{method}", identity.base_url);
    let access_token = identity.access_token.read().await.clone();
    let user_agent = identity.user_agent.read().await.clone();
    let mut builder = client
        .post(&url)
        .header("Authorization", format!("Bearer {access_token}"))
        .header("Content-Type", "application/json")
        .header("Accept-Encoding", "gzip")
        .header("User-Agent", user_agent)
        .json(&body);
    for (name, value) in extra_headers {
        builder = builder.header(*name, value);
    }
    builder.send().await.map_err(|err| err.to_string())
}

/// Warmup: sequence of four init RPCs with 50-200ms jitter between each,
/// run once when an account is activated.
async fn run_warmup(identity: &Arc<AccountIdentity>, proxy: Option<String>) {
    let calls: [(&str, serde_json::Value); 4] = [
        ("onboardUser", serde_json::json!({})),
        ("fetchAvailableModels", serde_json::json!({})),
        ("loadCodeAssist", serde_json::json!({})),
        ("recordCodeAssistMetrics", serde_json::json!({ "events": [] })),
    ];
    for (method, body) in calls {
        if let Err(err) = post_internal(identity, method, body, proxy.clone(), &[]).await {
            tracing::debug!(account_id = identity.account_id, method, error = %err, "warmup call failed");
        }
        tokio::time::sleep(warmup_jitter()).await;
    }
}

fn warmup_jitter() -> Duration {
    let ms = rand::rng().random_range(WARMUP_JITTER_MIN_MS..=WARMUP_JITTER_MAX_MS);
    Duration::from_millis(ms)
}

/// Heartbeat: one no-op metrics POST every second (±50ms jitter), suspended
/// while idle for 3 minutes but the timer keeps running so it resumes the
/// instant real traffic shows up again.
async fn run_heartbeat(identity: Arc<AccountIdentity>, proxy: Option<String>) {
    loop {
        let jitter_ms: i64 = rand::rng().random_range(-(HEARTBEAT_JITTER_MS as i64)..=(HEARTBEAT_JITTER_MS as i64));
        let delay = (HEARTBEAT_INTERVAL.as_millis() as i64 + jitter_ms).max(0) as u64;
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let idle_for = identity.last_activity.read().await.elapsed();
        if idle_for >= HEARTBEAT_IDLE_GATE {
            continue;
        }

        if let Err(err) = post_internal(
            &identity,
            "recordCodeAssistMetrics",
            serde_json::json!({ "events": [] }),
            proxy.clone(),
            &[],
        )
        .await
        {
            tracing::debug!(account_id = identity.account_id, error = %err, "heartbeat failed");
        }
    }
}

/// Unleash (feature flags): register/features/frontend + metrics on a
/// 60s±5s jitter, with a stable per-account connection id and an ETag cache
/// on the features call so repeated polls send `If-None-Match`.
async fn run_unleash(identity: Arc<AccountIdentity>, proxy: Option<String>) {
    loop {
        let jitter_s: i64 = rand::rng().random_range(-(UNLEASH_JITTER_SECS as i64)..=(UNLEASH_JITTER_SECS as i64));
        let delay = (UNLEASH_INTERVAL.as_secs() as i64 + jitter_s).max(1) as u64;
        tokio::time::sleep(Duration::from_secs(delay)).await;

        let etag = identity.unleash_etag.read().await.clone();
        let mut headers: Vec<(&str, String)> = vec![
            ("x-connection-id", identity.connection_id.clone()),
            ("x-started-at", identity.started_at_nanos.to_string()),
        ];
        if let Some(etag) = etag.as_ref() {
            headers.push(("If-None-Match", etag.clone()));
        }

        match post_internal(
            &identity,
            "unleash/features",
            serde_json::json!({}),
            proxy.clone(),
            &headers,
        )
        .await
        {
            Ok(resp) => {
                if let Some(new_etag) = resp
                    .headers()
                    .get("etag")
                    .and_then(|value| value.to_str().ok())
                {
                    *identity.unleash_etag.write().await = Some(new_etag.to_string());
                }
            }
            Err(err) => {
                tracing::debug!(account_id = identity.account_id, error = %err, "unleash poll failed");
            }
        }
    }
}

/// Version fetcher: hourly GET of an updater endpoint; on mismatch the
/// in-memory user-agent string is updated. Also triggerable reactively
/// (30s debounce) when upstream reports a version-outdated message.
async fn run_version_fetcher(identity: Arc<AccountIdentity>, proxy: Option<String>) {
    loop {
        check_version(&identity, proxy.clone()).await;
        tokio::time::sleep(VERSION_CHECK_INTERVAL).await;
    }
}

static LAST_REACTIVE_CHECK_NANOS: AtomicU64 = AtomicU64::new(0);

/// Called when upstream signals the client version is outdated. Debounced
/// to at most once per 30 seconds across all accounts.
pub async fn trigger_reactive_version_check(identity: &CamouflageHandle, proxy: Option<String>) {
    let now = now_nanos() as u64;
    let last = LAST_REACTIVE_CHECK_NANOS.load(Ordering::Relaxed);
    if now.saturating_sub(last) < VERSION_CHECK_DEBOUNCE.as_nanos() as u64 {
        return;
    }
    LAST_REACTIVE_CHECK_NANOS.store(now, Ordering::Relaxed);
    check_version(&identity.identity, proxy).await;
}

async fn check_version(identity: &Arc<AccountIdentity>, proxy: Option<String>) {
    let client = match client(proxy).await {
        Ok(client) => client,
        Err(err) => {
            tracing::debug!(account_id = identity.account_id, error = %err, "version check client build failed");
            return;
        }
    };
    let url = format!("{}/v1internal:fetchUpdaterVersion", identity.base_url);
    let resp = match client.get(&url).send().await {
        Ok(resp) => resp,
        Err(err) => {
            tracing::debug!(account_id = identity.account_id, error = %err, "version check failed");
            return;
        }
    };
    let Ok(body) = resp.json::<serde_json::Value>().await else {
        return;
    };
    let Some(latest) = body.get("version").and_then(|v| v.as_str()) else {
        return;
    };
    let current = identity.user_agent.read().await.clone();
    if !current.contains(latest) {
        let updated = format!("antigravity/{latest} (Windows; AMD64)");
        *identity.user_agent.write().await = updated;
    }
}

/// Derives a synthetic `trajectoryId` from a real requestId
/// (`agent/<epoch-ms>/<uuid>/<digit>` -> the uuid segment), so on-server
/// correlation still behaves normally.
fn trajectory_id_from_request_id(request_id: &str) -> String {
    request_id
        .split('/')
        .nth(2)
        .map(str::to_string)
        .unwrap_or_else(|| request_id.to_string())
}

async fn send_telemetry(
    identity: &AccountIdentity,
    request_id: &str,
    model: &str,
    proxy: Option<String>,
) -> Result<(), String> {
    let trajectory_id = trajectory_id_from_request_id(request_id);
    let body = serde_json::json!({
        "event": "conversationOffered",
        "trajectoryId": trajectory_id,
        "model": model,
        "timestampNanos": now_nanos().to_string(),
    });
    post_internal(identity, "recordEvent", body, proxy, &[])
        .await
        .map(|_| ())
}

async fn send_trajectory(
    identity: &AccountIdentity,
    request_id: &str,
    model: &str,
    proxy: Option<String>,
) -> Result<(), String> {
    let trajectory_id = trajectory_id_from_request_id(request_id);
    let placeholder_model = model_placeholder(model);
    let body = serde_json::json!({
        "trajectoryId": trajectory_id,
        "steps": [{
            "kind": "plannerResponse",
            "model": placeholder_model,
            "thinkingSignature": "",
            "tokenCount": synthetic_token_count(),
            "timestampNanos": now_nanos().to_string(),
        }],
    });
    post_internal(identity, "recordTrajectory", body, proxy, &[])
        .await
        .map(|_| ())
}

/// Model placeholder table keyed by a substring of the requested model —
/// the trajectory payload never claims the real model name verbatim.
fn model_placeholder(model: &str) -> &'static str {
    let lower = model.to_ascii_lowercase();
    if lower.contains("pro") {
        "models/gemini-pro-placeholder"
    } else if lower.contains("flash") {
        "models/gemini-flash-placeholder"
    } else if lower.contains("claude") {
        "models/claude-placeholder"
    } else {
        "models/unknown-placeholder"
    }
}

fn synthetic_token_count() -> u32 {
    rand::rng().random_range(50..=500)
}

fn random_connection_id() -> String {
    let mut bytes = [0u8; 8];
    let mut rng = rand::rng();
    rng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trajectory_id_extracted_from_third_segment() {
        let id = trajectory_id_from_request_id("agent/1700000000000/abcd-1234/0");
        assert_eq!(id, "abcd-1234");
    }

    #[test]
    fn trajectory_id_falls_back_to_whole_string_when_short() {
        let id = trajectory_id_from_request_id("not-a-request-id");
        assert_eq!(id, "not-a-request-id");
    }

    #[test]
    fn model_placeholder_buckets_by_family() {
        assert_eq!(model_placeholder("gemini-2.5-pro"), "models/gemini-pro-placeholder");
        assert_eq!(model_placeholder("gemini-2.5-flash"), "models/gemini-flash-placeholder");
        assert_eq!(model_placeholder("claude-sonnet-4"), "models/claude-placeholder");
        assert_eq!(model_placeholder("something-else"), "models/unknown-placeholder");
    }

    #[test]
    fn warmup_jitter_stays_within_spec_bounds() {
        for _ in 0..50 {
            let jitter = warmup_jitter();
            assert!(jitter.as_millis() >= WARMUP_JITTER_MIN_MS as u128);
            assert!(jitter.as_millis() <= WARMUP_JITTER_MAX_MS as u128);
        }
    }
}
