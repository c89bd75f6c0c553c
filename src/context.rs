//! Per-request routing context
//!
//! The context lives in a task-local slot. Block overrides (`using`,
//! `using_group`) run their body inside a new scope holding a copy of the
//! context with the override pushed, so the previous context comes back when
//! the body returns, fails, panics or is dropped. Request-level settings are
//! shared by every nested scope of the same request.
//!
//! A transaction body runs with the shard's exclusive session in its
//! context, so its own statements bypass the gate other calls wait on.

use std::cell::RefCell;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use shardrelay_core::{GroupName, Result, ShardName, ShardRelayError};

use crate::pool::ExclusiveSession;

tokio::task_local! {
    static ROUTING: RefCell<RoutingContext>;
}

/// A block-scoped override
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeOverride {
    Shard(ShardName),
    Group(GroupName),
}

/// Shard or group a context points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextTarget {
    Shard(ShardName),
    Group(GroupName),
}

/// Where a context target came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextLevel {
    /// Innermost `using`/`using_group` block
    Block,
    /// Request-level current shard or group
    Request,
}

#[derive(Debug, Default)]
struct RequestState {
    current_shard: Option<ShardName>,
    current_group: Option<GroupName>,
}

/// Routing state of one logical request
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    request: Arc<Mutex<RequestState>>,
    overrides: Vec<ScopeOverride>,
    transactions: Vec<Arc<ExclusiveSession>>,
}

impl RoutingContext {
    fn request(&self) -> MutexGuard<'_, RequestState> {
        self.request.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn overrides(&self) -> &[ScopeOverride] {
        &self.overrides
    }

    pub fn current_shard(&self) -> Option<ShardName> {
        self.request().current_shard.clone()
    }

    pub fn current_group(&self) -> Option<GroupName> {
        self.request().current_group.clone()
    }

    /// Session of an enclosing transaction on `shard`
    pub fn transaction(&self, shard: &ShardName) -> Option<Arc<ExclusiveSession>> {
        self.transactions
            .iter()
            .rev()
            .find(|session| session.shard() == shard)
            .cloned()
    }

    /// Highest-precedence target: innermost override, then the request's
    /// current shard, then its current group
    pub fn target(&self) -> Option<(ContextTarget, ContextLevel)> {
        if let Some(innermost) = self.overrides.last() {
            let target = match innermost {
                ScopeOverride::Shard(shard) => ContextTarget::Shard(shard.clone()),
                ScopeOverride::Group(group) => ContextTarget::Group(group.clone()),
            };
            return Some((target, ContextLevel::Block));
        }

        let request = self.request();
        if let Some(shard) = &request.current_shard {
            return Some((ContextTarget::Shard(shard.clone()), ContextLevel::Request));
        }
        request
            .current_group
            .clone()
            .map(|group| (ContextTarget::Group(group), ContextLevel::Request))
    }
}

/// Copy of the active context, or an empty one outside any request
pub fn snapshot() -> RoutingContext {
    ROUTING
        .try_with(|context| context.borrow().clone())
        .unwrap_or_default()
}

/// Run `body` with an override pushed on top of the active context
pub async fn with_override<F: Future>(scope: ScopeOverride, body: F) -> F::Output {
    let mut context = snapshot();
    context.overrides.push(scope);
    ROUTING.scope(RefCell::new(context), body).await
}

/// Run `body` pinned to the session's shard, issuing its statements
/// through the session
pub async fn with_transaction<F: Future>(session: Arc<ExclusiveSession>, body: F) -> F::Output {
    let mut context = snapshot();
    context.overrides.push(ScopeOverride::Shard(session.shard().clone()));
    context.transactions.push(session);
    ROUTING.scope(RefCell::new(context), body).await
}

/// Run `body` in a fresh request context
///
/// Open transactions of the enclosing task stay visible so the new request
/// does not wait on them.
pub async fn fresh<F: Future>(body: F) -> F::Output {
    let context = RoutingContext {
        transactions: snapshot().transactions,
        ..RoutingContext::default()
    };
    ROUTING.scope(RefCell::new(context), body).await
}

pub fn set_current_shard(shard: Option<ShardName>) -> Result<()> {
    update(|request| request.current_shard = shard)
}

pub fn set_current_group(group: Option<GroupName>) -> Result<()> {
    update(|request| request.current_group = group)
}

fn update<F: FnOnce(&mut RequestState)>(change: F) -> Result<()> {
    ROUTING
        .try_with(|context| {
            let context = context.borrow();
            let mut request = context.request();
            change(&mut request);
        })
        .map_err(|_| ShardRelayError::routing("No request context is active; run the call inside RoutingProxy::request"))
}
