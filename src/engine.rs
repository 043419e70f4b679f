//! 请求引擎
//!
//! 单请求的完整执行：头装配 → 协议计划（强制/仲裁）→ 取连接
//! （池或新拨）→ 发送 → 收响应 → cookie 回写 → 重定向/重试。
//! 可重试错误在这里按预算循环（指数退避加抖动），仲裁器记冷却；
//! 其余错误原样上浮，因果链保留。

use crate::cancel::CancelToken;
use crate::error::{Error, Protocol, Result};
use crate::headers::{self, RequestContext};
use crate::request::{Method, ParsedUrl, Request};
use crate::response::{Response, ResponseBody, Timing, BUFFER_SOFT_CAP};
use crate::session::SessionCore;
use crate::transport::arbiter::{race_with_head_start, Plan, RaceOutcome, H3_HEAD_START};
use crate::transport::h1::ResponseHead;
use crate::transport::pool::Transport;
use crate::transport::{h1, h2, h3, Origin};
use bytes::Bytes;
use log::{debug, warn};
use rand::Rng;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// 重试退避基线
const BACKOFF_BASE: Duration = Duration::from_millis(100);

/// 引擎入口：处理重定向循环，内层每跳做重试循环
pub(crate) async fn execute(core: &SessionCore, request: Request) -> Result<Response> {
    let started = Instant::now();
    let timeout = request.timeout.unwrap_or(core.options.timeout);
    let cancel = request
        .cancel
        .child_with_deadline(Instant::now() + timeout);

    let mut url = ParsedUrl::parse(&request.url)?;
    let mut method = request.method;
    let mut body = request.body.clone();
    let mut context = request.context.clone().unwrap_or_else(|| default_context(method));
    let mut history: Vec<String> = Vec::new();

    loop {
        let (head, response_body, protocol, timing) = attempt_with_retries(
            core,
            &url,
            method,
            &request,
            &body,
            &context,
            &cancel,
        )
        .await?;

        // 重定向？
        let is_redirect = core.options.allow_redirects
            && (300..400).contains(&head.status)
            && head.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("location"));

        if !is_redirect {
            return Ok(Response {
                status: head.status,
                headers: head.headers,
                protocol,
                final_url: url.to_url_string(),
                redirect_history: history,
                timing: Timing { total: started.elapsed(), ..timing },
                body: response_body,
            });
        }

        if history.len() >= core.options.max_redirects {
            return Err(Error::TooManyRedirects(core.options.max_redirects));
        }

        // 重定向体必须排干（cookie 在 attempt 里按体终点回写）
        drain_to_end(response_body).await;

        let location = head
            .headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("location"))
            .map(|(_, v)| v.clone())
            .expect("checked above");
        let next = url.join_location(&location)?;
        debug!("redirect {} -> {}", url.to_url_string(), next.to_url_string());

        history.push(url.to_url_string());
        // 303（及 301/302 的非 GET/HEAD）降级为 GET 并丢弃 body
        if head.status == 303
            || (matches!(head.status, 301 | 302) && !matches!(method, Method::Get | Method::Head))
        {
            method = Method::Get;
            body = crate::request::Body::Empty;
        }
        // 跨站重定向的上下文：referrer 指向上一跳
        context = RequestContext {
            mode: context.mode,
            dest: context.dest,
            user_triggered: false,
            referrer: Some(url.to_url_string()),
        };
        url = next;
    }
}

fn default_context(method: Method) -> RequestContext {
    match method {
        Method::Get | Method::Head => RequestContext::navigation(),
        _ => RequestContext {
            mode: crate::headers::FetchMode::Cors,
            dest: crate::headers::FetchDest::Xhr,
            user_triggered: false,
            referrer: None,
        },
    }
}

/// 重试循环：可重试错误按预算退避重来；
/// 预写式 CONNECT 错误触发对该 (代理, 协议) 的一次性降级重试。
#[allow(clippy::too_many_arguments)]
async fn attempt_with_retries(
    core: &SessionCore,
    url: &ParsedUrl,
    method: Method,
    request: &Request,
    body: &crate::request::Body,
    context: &RequestContext,
    cancel: &CancelToken,
) -> Result<(ResponseHead, ResponseBody, Protocol, Timing)> {
    let max_retries = core.options.max_retries;
    let mut attempt = 0usize;

    loop {
        let outcome = attempt_once(core, url, method, request, body, context, cancel).await;

        let err = match outcome {
            Ok(success) => {
                let (head, resp_body, protocol, timing) = success;
                // 状态码重试：幂等 + 名单内 + 预算未尽
                let retriable_status = matches!(head.status, 408 | 425 | 429 | 500 | 502 | 503 | 504);
                if retriable_status && method.is_idempotent() && attempt < max_retries {
                    drain_to_end(resp_body).await;
                    attempt += 1;
                    backoff(attempt, cancel).await?;
                    continue;
                }
                return Ok((head, resp_body, protocol, timing));
            }
            Err(e) => e,
        };

        // 预写式失败：拉黑后立刻重试一次（不占退避也不占预算）
        if let Error::SpeculativeTls { status, .. } = &err {
            if let Some(proxy) = core.tcp_proxy() {
                let pk = proxy.pool_key();
                if !core.arbiter.speculative_blocked(&pk, Protocol::Http1) {
                    warn!(
                        "speculative CONNECT via {pk} failed (status {:?}); retrying sequential",
                        status
                    );
                    core.arbiter.block_speculative(&pk, Protocol::Http1);
                    core.arbiter.block_speculative(&pk, Protocol::Http2);
                    continue;
                }
            }
        }

        if err.is_terminal() || !err.is_retriable() || !body.is_replayable() {
            return Err(err);
        }
        if attempt >= max_retries {
            return Err(err);
        }
        attempt += 1;
        debug!("retry {attempt}/{max_retries} after {err}");
        backoff(attempt, cancel).await?;
    }
}

/// 指数退避 + 抖动，与取消令牌竞争
async fn backoff(attempt: usize, cancel: &CancelToken) -> Result<()> {
    let exp = BACKOFF_BASE * (1u32 << (attempt.min(6) as u32));
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..50));
    let wait = exp + jitter;
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(wait) => Ok(()),
    }
}

/// 单次尝试：定协议计划并执行
async fn attempt_once(
    core: &SessionCore,
    url: &ParsedUrl,
    method: Method,
    request: &Request,
    body: &crate::request::Body,
    context: &RequestContext,
    cancel: &CancelToken,
) -> Result<(ResponseHead, ResponseBody, Protocol, Timing)> {
    let origin = url.origin();
    let origin_key = origin.key();

    let plan = match core.forced_protocol() {
        Some(p) => Plan::Only(p),
        None if !url.https => Plan::Only(Protocol::Http1),
        None => core.arbiter.plan(
            &origin_key,
            core.preset.supports.h3 && core.udp_available(),
            core.preset.supports.h2,
        ),
    };

    let early_data_ok = method.is_idempotent() || request.allow_early_data;
    let dial_started = Instant::now();

    let (transport, guard, protocol) = match plan {
        Plan::Only(p) => match obtain_connection(core, &origin, p, early_data_ok, cancel).await {
            Ok(found) => found,
            Err(e) => {
                classify_failure(core, &origin_key, &e);
                return Err(e);
            }
        },
        Plan::RaceH3H2 => {
            // 竞速双方各持一个子令牌，败者被协同取消
            let h3_cancel = cancel.child();
            let h2_cancel = cancel.child();
            let h3_fut = obtain_connection(core, &origin, Protocol::Http3, early_data_ok, &h3_cancel);
            let h2_fut = obtain_connection(core, &origin, Protocol::Http2, early_data_ok, &h2_cancel);
            match race_with_head_start(h3_fut, h2_fut, H3_HEAD_START, &h3_cancel, &h2_cancel).await
            {
                Ok(RaceOutcome::Primary(found)) => found,
                Ok(RaceOutcome::Secondary(found)) => {
                    core.arbiter.record_h3_failure(&origin_key);
                    found
                }
                Err(e) => {
                    if matches!(e, Error::Http3Unavailable { .. }) {
                        core.arbiter.record_h3_failure(&origin_key);
                    }
                    return Err(e);
                }
            }
        }
    };

    let dial_elapsed = dial_started.elapsed();

    // 头装配（协议已定，Host/逐跳头按协议裁剪）
    let cookie_header = core.jar.header_for(&url.host, url.path_only(), url.https);
    let assembled = headers::assemble(
        &core.preset,
        context,
        &origin.authority(),
        url.https,
        &request.headers,
        cookie_header.as_deref(),
        core.options.tls_only,
        protocol,
    );

    let send_started = Instant::now();
    let sent = send_on_transport(
        core,
        transport,
        &origin,
        protocol,
        method,
        url,
        &assembled,
        body,
        cancel,
        guard,
    )
    .await;

    let (head, body_rx) = match sent {
        Ok(v) => v,
        Err(e) => {
            classify_failure(core, &origin_key, &e);
            return Err(e);
        }
    };
    core.arbiter.record_success(&origin_key, protocol);

    // Alt-Svc 观测
    if let Some(alt_svc) = head
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("alt-svc"))
        .map(|(_, v)| v.clone())
    {
        core.arbiter.observe_alt_svc(&origin_key, &alt_svc);
    }

    let timing = Timing {
        dns: None,
        connect: Some(dial_elapsed),
        tls: None,
        first_byte: Some(send_started.elapsed()),
        total: Duration::ZERO,
    };

    // 体物化决策：已知长度且在软上限内 → 整体缓冲并在体终点回写 cookie
    let content_length = head
        .headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok());
    let buffer = content_length.map(|n| n <= BUFFER_SOFT_CAP as u64).unwrap_or(false)
        || (300..400).contains(&head.status);

    let response_body = if buffer {
        let mut collected = Vec::with_capacity(content_length.unwrap_or(0) as usize);
        let mut rx = body_rx;
        while let Some(chunk) = rx.recv().await {
            collected.extend_from_slice(&chunk?);
        }
        store_cookies(core, url, &head);
        ResponseBody::Full(Bytes::from(collected))
    } else {
        // 流式：cookie 在头到达时回写（体终点不可观测）
        store_cookies(core, url, &head);
        ResponseBody::Stream(body_rx)
    };

    Ok((head, response_body, protocol, timing))
}

fn store_cookies(core: &SessionCore, url: &ParsedUrl, head: &ResponseHead) {
    for (k, v) in &head.headers {
        if k.eq_ignore_ascii_case("set-cookie") {
            core.jar.store_from_response(v, &url.host);
        }
    }
}

fn classify_failure(core: &SessionCore, origin_key: &str, err: &Error) {
    match err {
        Error::Http3Unavailable { .. } => core.arbiter.record_h3_failure(origin_key),
        Error::Http2PrefaceRejected { .. } => core.arbiter.record_h2_preface_reject(origin_key),
        _ => {}
    }
}

/// 池取或新拨；握手期间不持池锁（先 reserve 占位）
async fn obtain_connection(
    core: &SessionCore,
    origin: &Origin,
    protocol: Protocol,
    early_data_ok: bool,
    cancel: &CancelToken,
) -> Result<(Transport, crate::transport::pool::InFlightGuard, Protocol)> {
    let key = core.pool_key(origin, protocol);

    if let Some((transport, guard)) = core.pool.checkout(&key) {
        debug!("pool hit for {origin} {protocol}");
        return Ok((transport, guard, protocol));
    }

    let guard = core.pool.reserve(&key);
    let config = core.dial_config(protocol);

    let transport = match protocol {
        Protocol::Http1 => Transport::H1(h1::dial(origin, &config, cancel).await?),
        Protocol::Http2 => {
            let handle = h2::dial(origin, &config, cancel).await?;
            // 多路复用句柄补进池
            core.pool.put(key.clone(), Transport::H2(handle.clone()));
            Transport::H2(handle)
        }
        Protocol::Http3 => {
            let handle = h3::dial(origin, &config, early_data_ok, cancel).await?;
            core.pool.put(key.clone(), Transport::H3(handle.clone()));
            Transport::H3(handle)
        }
    };
    Ok((transport, guard, protocol))
}

/// 在取到的传输上发请求；守卫活到体排干（或调用方放弃）
#[allow(clippy::too_many_arguments)]
async fn send_on_transport(
    core: &SessionCore,
    transport: Transport,
    origin: &Origin,
    protocol: Protocol,
    method: Method,
    url: &ParsedUrl,
    headers: &[(String, String)],
    body: &crate::request::Body,
    cancel: &CancelToken,
    guard: crate::transport::pool::InFlightGuard,
) -> Result<(ResponseHead, mpsc::Receiver<Result<Bytes>>)> {
    match transport {
        Transport::H1(conn) => {
            let (head, body_rx, reuse) = conn
                .send_request(method.as_str(), &url.path, headers, body, cancel)
                .await?;
            // 排干后归还；调用方放弃则连接随任务结束丢弃
            let pool = core.pool.clone();
            let key = core.pool_key(origin, protocol);
            tokio::spawn(async move {
                let _guard = guard;
                if let Ok(conn) = reuse.await {
                    pool.put(key, Transport::H1(conn));
                }
            });
            Ok((head, body_rx))
        }
        Transport::H2(mut handle) => {
            let result = handle
                .send_request(method.as_str(), &url.path, headers, body, cancel)
                .await;
            match result {
                Ok((head, body_rx)) => {
                    Ok((head, forward_with_guard(body_rx, guard)))
                }
                Err(e) => {
                    core.pool.discard(&core.pool_key(origin, protocol));
                    Err(e)
                }
            }
        }
        Transport::H3(mut handle) => {
            let result = handle
                .send_request(method.as_str(), &url.path, headers, body, cancel)
                .await;
            match result {
                Ok((head, body_rx)) => Ok((head, forward_with_guard(body_rx, guard))),
                Err(e) => {
                    core.pool.discard(&core.pool_key(origin, protocol));
                    Err(e)
                }
            }
        }
    }
}

/// 把体通道转一跳，让在途守卫活到体真正读完
fn forward_with_guard(
    mut rx: mpsc::Receiver<Result<Bytes>>,
    guard: crate::transport::pool::InFlightGuard,
) -> mpsc::Receiver<Result<Bytes>> {
    let (tx, out) = mpsc::channel(16);
    tokio::spawn(async move {
        let _guard = guard;
        while let Some(item) = rx.recv().await {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });
    out
}

async fn drain_to_end(body: ResponseBody) {
    if let ResponseBody::Stream(mut rx) = body {
        while rx.recv().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_context_by_method() {
        let get = default_context(Method::Get);
        assert_eq!(get.mode, crate::headers::FetchMode::Navigate);
        let post = default_context(Method::Post);
        assert_eq!(post.mode, crate::headers::FetchMode::Cors);
        assert_eq!(post.dest, crate::headers::FetchDest::Xhr);
    }

    #[tokio::test]
    async fn test_backoff_respects_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let r = backoff(3, &cancel).await;
        assert!(matches!(r, Err(Error::Cancelled)));
    }
}
