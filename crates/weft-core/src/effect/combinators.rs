//! all / any / race.
//!
//! Children are interleaved on the current task with `FuturesUnordered`.
//! Losers of `any` and `race` are cancelled through a child signal and then
//! drained, so their finalizers have run by the time the combinator settles.

use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use tracing::trace;

use super::engine::execute;
use super::node::{Env, Exit, Node, Value};
use crate::error::Failure;

/// Every node must succeed; values keep input order.
///
/// Admission is FIFO under `concurrency` (falling back to the run default).
/// After the first failure nothing new is admitted; in-flight nodes settle
/// and the failure with the lowest index wins.
pub(crate) async fn all(nodes: Arc<[Arc<Node>]>, concurrency: Option<usize>, env: Env) -> Exit {
    let limit = concurrency
        .or(env.default_concurrency)
        .unwrap_or(usize::MAX)
        .max(1);
    let mut values: Vec<Option<Value>> = nodes.iter().map(|_| None).collect();
    let mut failure: Option<(usize, Failure)> = None;
    let mut pending = nodes.iter().cloned().enumerate();
    let mut running = FuturesUnordered::new();

    loop {
        while failure.is_none() && running.len() < limit {
            let Some((index, node)) = pending.next() else {
                break;
            };
            running.push(execute(node, env.clone()).map(move |exit| (index, exit)));
        }
        let Some((index, exit)) = running.next().await else {
            break;
        };
        match exit {
            Ok(value) => values[index] = Some(value),
            Err(err) => {
                trace!(index, error = %err, "all: branch failed");
                if failure.as_ref().is_none_or(|(first, _)| index < *first) {
                    failure = Some((index, err));
                }
            }
        }
    }

    if let Some((_, failure)) = failure {
        return Err(failure);
    }
    let values: Vec<Value> = values.into_iter().flatten().collect();
    Ok(Box::new(values))
}

/// First success wins; if every node fails, an aggregate in input order.
pub(crate) async fn any(nodes: Arc<[Arc<Node>]>, env: Env) -> Exit {
    let child = env.signal.child_token();
    let branch = env.with_signal(child.clone());
    let mut running: FuturesUnordered<_> = nodes
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, node)| execute(node, branch.clone()).map(move |exit| (index, exit)))
        .collect();
    let mut errors: Vec<Option<Failure>> = vec![None; nodes.len()];

    while let Some((index, exit)) = running.next().await {
        match exit {
            Ok(value) => {
                trace!(index, "any: branch succeeded, cancelling the rest");
                child.cancel();
                while running.next().await.is_some() {}
                return Ok(value);
            }
            Err(err) => errors[index] = Some(err),
        }
    }

    if env.signal.is_cancelled() {
        return Err(Failure::aborted());
    }
    Err(Failure::Aggregate(errors.into_iter().flatten().collect()))
}

/// First settlement wins, success or failure.
pub(crate) async fn race(nodes: Arc<[Arc<Node>]>, env: Env) -> Exit {
    let child = env.signal.child_token();
    let branch = env.with_signal(child.clone());
    let mut running: FuturesUnordered<_> = nodes
        .iter()
        .cloned()
        .map(|node| execute(node, branch.clone()))
        .collect();

    let Some(exit) = running.next().await else {
        return Err(Failure::unexpected("race over no effects"));
    };
    child.cancel();
    while running.next().await.is_some() {}
    exit
}
