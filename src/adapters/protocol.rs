//! Broker wire protocol.
//!
//! One JSON object per line in each direction. Requests arrive wrapped in an
//! [`Envelope`] carrying the authenticated user; responses are tagged by
//! `status`:
//!
//! ```text
//! {"user":"alice","request":{"op":"acquire","targets":["qemu-01"],"priority":10}}
//! {"status":"ok","allocation":{"id":7,"state":"active",...}}
//! {"status":"error","kind":"busy","message":"target qemu-01 is busy"}
//! ```
//!
//! An envelope may name a `server`; a federated broker forwards such requests
//! to that server through its gateway.

use crate::alloc::{AcquireRequest, AllocationId, AllocationView};
use crate::core::config::ALL_COMPONENTS;
use crate::core::error::{ComponentFailure, CorralError, ErrorKind};
use crate::federation::FederatedView;
use crate::power::{PowerCommand, PowerReport};
use crate::registry::{ComponentPower, TargetView};
use serde::{Deserialize, Serialize};

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// User as established by the fronting authentication layer.
    pub user: String,
    /// Server that should execute the request. Absent means the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    pub request: BrokerRequest,
}

impl Envelope {
    pub fn new(user: impl Into<String>, request: BrokerRequest) -> Self {
        Self {
            user: user.into(),
            server: None,
            request,
        }
    }

    pub fn routed_to(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }
}

/// Broker operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BrokerRequest {
    ListTargets,
    ListAllocations,
    Acquire(AcquireRequest),
    Release {
        allocation_id: AllocationId,
    },
    Keepalive {
        allocation_id: AllocationId,
    },
    /// Block until the allocation leaves `queued` or `timeout_ms` passes.
    Wait {
        allocation_id: AllocationId,
        timeout_ms: u64,
    },
    AddGuest {
        allocation_id: AllocationId,
        guest: String,
    },
    RemoveGuest {
        allocation_id: AllocationId,
        guest: String,
    },
    Power {
        target: String,
        #[serde(default = "all_components")]
        component: String,
        command: PowerCommand,
    },
    GetPower {
        target: String,
    },
    /// Local targets and allocations with the server id; feeds federation.
    Listing,
    /// Aggregated view across every federated server.
    FederatedListing,
}

fn all_components() -> String {
    ALL_COMPONENTS.to_string()
}

impl BrokerRequest {
    /// Operation name for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::ListTargets => "list_targets",
            Self::ListAllocations => "list_allocations",
            Self::Acquire(_) => "acquire",
            Self::Release { .. } => "release",
            Self::Keepalive { .. } => "keepalive",
            Self::Wait { .. } => "wait",
            Self::AddGuest { .. } => "add_guest",
            Self::RemoveGuest { .. } => "remove_guest",
            Self::Power { .. } => "power",
            Self::GetPower { .. } => "get_power",
            Self::Listing => "listing",
            Self::FederatedListing => "federated_listing",
        }
    }
}

/// Body of a successful response. Only the fields an operation produces are
/// present on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<Vec<TargetView>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocations: Option<Vec<AllocationView>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation: Option<AllocationView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<PowerReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentPower>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub federation: Option<FederatedView>,
}

impl ResponseBody {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn targets(targets: Vec<TargetView>) -> Self {
        Self {
            targets: Some(targets),
            ..Self::default()
        }
    }

    pub fn allocations(allocations: Vec<AllocationView>) -> Self {
        Self {
            allocations: Some(allocations),
            ..Self::default()
        }
    }

    pub fn allocation(allocation: AllocationView) -> Self {
        Self {
            allocation: Some(allocation),
            ..Self::default()
        }
    }

    pub fn power(report: PowerReport) -> Self {
        Self {
            power: Some(report),
            ..Self::default()
        }
    }

    pub fn components(components: Vec<ComponentPower>) -> Self {
        Self {
            components: Some(components),
            ..Self::default()
        }
    }

    pub fn listing(
        server: impl Into<String>,
        targets: Vec<TargetView>,
        allocations: Vec<AllocationView>,
    ) -> Self {
        Self {
            server: Some(server.into()),
            targets: Some(targets),
            allocations: Some(allocations),
            ..Self::default()
        }
    }

    pub fn federation(view: FederatedView) -> Self {
        Self {
            federation: Some(view),
            ..Self::default()
        }
    }
}

/// Body of an error response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
    /// Per-component failures of a partially failed power command.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ComponentFailure>,
}

impl From<&CorralError> for ErrorBody {
    fn from(error: &CorralError) -> Self {
        let failures = match error {
            CorralError::PartialFailure { failures, .. } => failures.clone(),
            _ => Vec::new(),
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            failures,
        }
    }
}

impl From<ErrorBody> for CorralError {
    fn from(body: ErrorBody) -> Self {
        CorralError::Remote {
            kind: body.kind,
            message: body.message,
        }
    }
}

/// Response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BrokerResponse {
    Ok(ResponseBody),
    Error(ErrorBody),
}

impl BrokerResponse {
    pub fn from_result(result: Result<ResponseBody, CorralError>) -> Self {
        match result {
            Ok(body) => Self::Ok(body),
            Err(error) => Self::Error(ErrorBody::from(&error)),
        }
    }

    pub fn into_result(self) -> Result<ResponseBody, CorralError> {
        match self {
            Self::Ok(body) => Ok(body),
            Self::Error(body) => Err(body.into()),
        }
    }
}
