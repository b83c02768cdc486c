//! Interpreter for effect nodes.
//!
//! `execute` walks the chain bottom-up: each step first settles its upstream,
//! then applies itself. Everything runs inside the caller's future; nothing
//! is spawned.
//!
//! Cancellation:
//! - sources check the signal before they start
//! - leaf futures are raced against the signal and settle `Abort` when it fires
//! - finalizers run with a detached signal so cleanup always completes

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::node::{Env, Exit, Next, Node, Step};
use crate::error::Failure;
use crate::tracer::{SpanBody, TRACER};

pub(crate) fn execute(node: Arc<Node>, env: Env) -> BoxFuture<'static, Exit> {
    async move {
        match &*node {
            Node::Source { source, .. } => {
                if env.signal.is_cancelled() {
                    return Err(Failure::aborted());
                }
                let next = invoke(|| source(&env));
                settle(next, &env).await
            }
            Node::Step { upstream, step, .. } => run_step(upstream, step, &env).await,
        }
    }
    .boxed()
}

/// Drive a `Next` to its settlement.
async fn settle(next: Next, env: &Env) -> Exit {
    match next {
        Next::Value(value) => Ok(value),
        Next::Fail(failure) => Err(failure),
        Next::Future(future) => guarded(future, &env.signal).await,
        Next::Cooperative(future) => AssertUnwindSafe(future)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(Failure::from_panic(panic))),
        Next::Effect(node) => execute(node, env.clone()).await,
    }
}

/// Call user code; a panic becomes an unexpected failure.
fn invoke(f: impl FnOnce() -> Next) -> Next {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| Next::Fail(Failure::from_panic(panic)))
}

async fn guarded(future: BoxFuture<'static, Exit>, signal: &CancellationToken) -> Exit {
    let future = AssertUnwindSafe(future).catch_unwind();
    tokio::select! {
        biased;
        outcome = future => outcome.unwrap_or_else(|panic| Err(Failure::from_panic(panic))),
        _ = signal.cancelled() => Err(Failure::aborted()),
    }
}

async fn run_step(upstream: &Arc<Node>, step: &Step, env: &Env) -> Exit {
    match step {
        Step::Map(transform) => {
            let value = execute(Arc::clone(upstream), env.clone()).await?;
            let next = invoke(|| transform(value, env));
            settle(next, env).await
        }

        Step::Catch(recover) => match execute(Arc::clone(upstream), env.clone()).await {
            Ok(value) => Ok(value),
            Err(failure) if failure.is_defect() => Err(failure),
            Err(failure) => {
                let next = invoke(|| recover(failure, env).unwrap_or_else(Next::Fail));
                settle(next, env).await
            }
        },

        Step::Tap(tap) => {
            let value = execute(Arc::clone(upstream), env.clone()).await?;
            let next = invoke(|| tap(&value, env));
            settle(next, env).await?;
            Ok(value)
        }

        Step::TapError(tap) => match execute(Arc::clone(upstream), env.clone()).await {
            Ok(value) => Ok(value),
            Err(failure) => {
                let next = invoke(|| tap(&failure, env));
                settle(next, env).await?;
                Err(failure)
            }
        },

        Step::Finally(finalizer) => {
            let exit = execute(Arc::clone(upstream), env.clone()).await;
            let cleanup_env = env.detached();
            let next = invoke(|| finalizer(&cleanup_env));
            match (exit, settle(next, &cleanup_env).await) {
                (exit, Ok(_)) => exit,
                (Ok(_), Err(cleanup)) => Err(cleanup),
                (Err(failure), Err(cleanup)) => {
                    warn!(
                        error = %failure,
                        finalizer_error = %cleanup,
                        "finalizer failed after upstream failure, keeping upstream failure"
                    );
                    Err(failure)
                }
            }
        }

        Step::Timeout { after, fallback } => {
            let child = env.signal.child_token();
            let mut running = execute(Arc::clone(upstream), env.with_signal(child.clone()));
            tokio::select! {
                biased;
                exit = &mut running => exit,
                _ = tokio::time::sleep(*after) => {
                    debug!(after = ?after, "timeout expired, cancelling upstream");
                    child.cancel();
                    // Let the upstream settle so its finalizers run.
                    let _ = running.await;
                    match fallback {
                        Some(fallback) => execute(Arc::clone(fallback), env.clone()).await,
                        None => Err(Failure::Timeout { after: *after }),
                    }
                }
            }
        }

        Step::Retry(policy) => {
            let mut attempt = 0_u32;
            loop {
                let failure = match execute(Arc::clone(upstream), env.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(failure) => failure,
                };
                if attempt >= policy.times || !policy.accepts(&failure) {
                    return Err(failure);
                }
                attempt += 1;
                let delay = policy.next_delay(attempt);
                debug!(
                    attempt,
                    times = policy.times,
                    delay = ?delay,
                    error = %failure,
                    "retrying effect"
                );
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = env.signal.cancelled() => return Err(Failure::aborted()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        Step::Provide(provider) => {
            let scoped = env.with_context(env.ctx.layer(provider));
            execute(Arc::clone(upstream), scoped).await
        }

        Step::Span { name, attributes } => {
            let tracer = env.ctx.get(TRACER).await?;
            let body = SpanBody::new(execute(Arc::clone(upstream), env.clone()));
            tracer.span(name, attributes, body).await.into_exit()
        }
    }
}
