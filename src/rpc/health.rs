//! Built-in health service (`grpc.health.v1.Health`).
//!
//! Reports `SERVING` while the runtime accepts calls and `NOT_SERVING` once
//! it starts draining. A named service that is not registered yields
//! `NOT_FOUND`.

use std::sync::Weak;

use bytes::Bytes;
use futures_util::StreamExt;
use prost::Message;

use crate::lifecycle::PhaseWatch;
use crate::rpc::descriptor::{MessageStream, ServiceDesc};
use crate::rpc::table::ServiceTable;
use crate::rpc::{CallContext, Status};

pub const SERVICE_NAME: &str = "grpc.health.v1.Health";

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckRequest {
    #[prost(string, tag = "1")]
    pub service: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthCheckResponse {
    #[prost(enumeration = "ServingStatus", tag = "1")]
    pub status: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ServingStatus {
    Unknown = 0,
    Serving = 1,
    NotServing = 2,
    ServiceUnknown = 3,
}

/// Build the health service. Holds the table weakly since it is registered
/// into that same table.
pub fn service(table: Weak<ServiceTable>, phase: PhaseWatch) -> ServiceDesc {
    let check_table = table.clone();
    let check_phase = phase.clone();

    ServiceDesc::new(SERVICE_NAME)
        .unary_message("Check", move |_ctx: CallContext, req: HealthCheckRequest| {
            let result = status_for(&check_table, &check_phase, &req.service);
            async move {
                result.map(|status| HealthCheckResponse {
                    status: status as i32,
                })
            }
        })
        .stream("Watch", false, true, move |_ctx, input| {
            watch(table.clone(), phase.clone(), input)
        })
}

async fn watch(
    table: Weak<ServiceTable>,
    phase: PhaseWatch,
    mut input: MessageStream,
) -> Result<MessageStream, Status> {
    let request = match input.next().await {
        Some(Ok(bytes)) => HealthCheckRequest::decode(bytes)
            .map_err(|e| Status::invalid_argument(format!("malformed request: {e}")))?,
        Some(Err(status)) => return Err(status),
        None => HealthCheckRequest::default(),
    };
    let current = status_for(&table, &phase, &request.service)?;

    // One update now, one more when draining begins.
    let updates = futures_util::stream::unfold(Some(current), move |state| {
        let phase = phase.clone();
        async move {
            let Some(status) = state else {
                return None;
            };
            let next = if status == ServingStatus::Serving {
                phase.draining().await;
                Some(ServingStatus::NotServing)
            } else {
                None
            };
            Some((Ok(encode(status)), next))
        }
    });
    Ok(updates.boxed())
}

fn status_for(
    table: &Weak<ServiceTable>,
    phase: &PhaseWatch,
    service: &str,
) -> Result<ServingStatus, Status> {
    if !service.is_empty() {
        let known = table.upgrade().is_some_and(|t| t.contains(service));
        if !known {
            return Err(Status::not_found(format!("unknown service {service}")));
        }
    }
    Ok(if phase.is_serving() {
        ServingStatus::Serving
    } else {
        ServingStatus::NotServing
    })
}

fn encode(status: ServingStatus) -> Bytes {
    Bytes::from(
        HealthCheckResponse {
            status: status as i32,
        }
        .encode_to_vec(),
    )
}
