//! Routing decisions and the per-call state machine

use std::fmt;

use shardrelay_core::{CallId, Result, ShardName, ShardRelayError};

/// Why a call was routed where it was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    /// Shard given for this call (`ShardScope`, association owner)
    Explicit,
    /// Shard the record is already assigned to
    Record,
    /// Innermost `using` or `using_group` block
    Block,
    /// Request-level current shard or group
    Request,
    /// Placement directory
    Placement,
    /// Model tracker
    Tracker,
    /// The only shard holding the key when nothing else could tell
    Scan,
    RoundRobin,
    Master,
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RouteSource::Explicit => "explicit",
            RouteSource::Record => "record",
            RouteSource::Block => "block",
            RouteSource::Request => "request",
            RouteSource::Placement => "placement",
            RouteSource::Tracker => "tracker",
            RouteSource::Scan => "scan",
            RouteSource::RoundRobin => "round_robin",
            RouteSource::Master => "master",
        };
        f.write_str(label)
    }
}

/// The shard a call runs on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub shard: ShardName,
    pub source: RouteSource,
}

impl Route {
    pub fn new(shard: ShardName, source: RouteSource) -> Self {
        Self { shard, source }
    }

    pub fn master() -> Self {
        Self::new(ShardName::master(), RouteSource::Master)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallState {
    Unrouted,
    Resolving,
    Routed(Route),
    Executing(Route),
    Completed(Route),
    Failed,
}

impl CallState {
    fn label(&self) -> &'static str {
        match self {
            CallState::Unrouted => "unrouted",
            CallState::Resolving => "resolving",
            CallState::Routed(_) => "routed",
            CallState::Executing(_) => "executing",
            CallState::Completed(_) => "completed",
            CallState::Failed => "failed",
        }
    }
}

/// One intercepted call
///
/// The route decided while resolving is reused by every statement of the
/// call and dropped with it.
#[derive(Debug)]
pub struct RoutedCall {
    id: CallId,
    operation: &'static str,
    state: CallState,
}

impl RoutedCall {
    pub fn new(operation: &'static str) -> Self {
        Self {
            id: CallId::new(),
            operation,
            state: CallState::Unrouted,
        }
    }

    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    pub fn state(&self) -> &CallState {
        &self.state
    }

    pub fn span(&self) -> tracing::Span {
        tracing::debug_span!("routed_call", call_id = %self.id, operation = self.operation)
    }

    pub fn begin_resolution(&mut self) -> Result<()> {
        match self.state {
            CallState::Unrouted => {
                self.state = CallState::Resolving;
                Ok(())
            }
            _ => Err(self.illegal("resolve")),
        }
    }

    pub fn routed(&mut self, route: Route) -> Result<()> {
        match self.state {
            CallState::Resolving => {
                tracing::debug!("{} routed to {} ({})", self.operation, route.shard, route.source);
                self.state = CallState::Routed(route);
                Ok(())
            }
            _ => Err(self.illegal("route")),
        }
    }

    /// The decided route
    pub fn route(&self) -> Result<&Route> {
        match &self.state {
            CallState::Routed(route) | CallState::Executing(route) | CallState::Completed(route) => Ok(route),
            _ => Err(self.illegal("read the route of")),
        }
    }

    /// Enter execution, returning the shard to run on
    ///
    /// A call issuing several statements stays in `Executing`.
    pub fn begin_execution(&mut self) -> Result<ShardName> {
        match &self.state {
            CallState::Routed(route) | CallState::Executing(route) => {
                let route = route.clone();
                let shard = route.shard.clone();
                self.state = CallState::Executing(route);
                Ok(shard)
            }
            _ => Err(self.illegal("execute")),
        }
    }

    /// Record the outcome of the call
    pub fn settle<T>(&mut self, result: &Result<T>) {
        self.state = match (std::mem::replace(&mut self.state, CallState::Failed), result) {
            (CallState::Executing(route), Ok(_)) | (CallState::Routed(route), Ok(_)) => CallState::Completed(route),
            (_, Ok(_)) => {
                tracing::warn!("{} call {} finished without a route", self.operation, self.id);
                CallState::Failed
            }
            (_, Err(e)) => {
                tracing::debug!("{} call {} failed: {}", self.operation, self.id, e);
                CallState::Failed
            }
        };
    }

    fn illegal(&self, action: &str) -> ShardRelayError {
        ShardRelayError::routing(format!(
            "Cannot {} {} call {} while {}",
            action,
            self.operation,
            self.id,
            self.state.label()
        ))
    }
}
