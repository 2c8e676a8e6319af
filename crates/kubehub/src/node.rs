//! Node capacity override: scales a node's advertised cpu and memory by a fixed
//! multiple.
//!
//! The pre-scaling values are recorded in the `cpuAllocatable` / `memAllocatable`
//! annotations. A node is (re)scaled when an annotation is missing or still equals
//! the live allocatable value, i.e. the kubelet has reset the status since the last
//! scaling.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{controller::Action, watcher, Controller},
    Client,
};
use metrics::counter;
use serde_json::json;
use tracing::{debug, info, warn};

pub const CPU_ANNOTATION: &str = "cpuAllocatable";
pub const MEM_ANNOTATION: &str = "memAllocatable";
pub const DEFAULT_MULTIPLE: u32 = 4;

const NANO: i128 = 1_000_000_000;

#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    #[error("invalid quantity {0:?}")]
    Quantity(String),
    #[error("node api request failed")]
    Kube(#[from] kube::Error),
}

/// Multiplier from a raw setting; zero, empty or unparsable values fall back to
/// [`DEFAULT_MULTIPLE`].
pub fn multiple_from(raw: Option<&str>) -> u32 {
    match raw.and_then(|s| s.trim().parse::<u32>().ok()) {
        Some(0) | None => DEFAULT_MULTIPLE,
        Some(n) => n,
    }
}

/// Parse a Kubernetes quantity into nano-units (`1` == 1_000_000_000).
/// Sub-nano remainders are rounded up.
pub fn parse_quantity(raw: &str) -> Result<i128, NodeError> {
    let bad = || NodeError::Quantity(raw.to_string());
    let s = raw.trim();
    let split = s.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '+' || c == '-')).unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let (negative, num) = match num.as_bytes().first() {
        Some(b'-') => (true, &num[1..]),
        Some(b'+') => (false, &num[1..]),
        _ => (false, num),
    };
    let (int_part, frac_part) = num.split_once('.').unwrap_or((num, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(bad());
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }

    // mantissa as an integer plus a power-of-ten scale
    let digits = format!("{}{}", int_part, frac_part);
    let mantissa: i128 = digits.parse().map_err(|_| bad())?;
    let frac_len = i32::try_from(frac_part.len()).map_err(|_| bad())?;
    let suffix_exp: i32 = match suffix {
        "" | "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => 0,
        "n" => -9,
        "u" => -6,
        "m" => -3,
        "k" => 3,
        "M" => 6,
        "G" => 9,
        "T" => 12,
        "P" => 15,
        "E" => 18,
        other => {
            let e = other.strip_prefix(['e', 'E']).ok_or_else(bad)?;
            e.parse::<i32>().map_err(|_| bad())?
        }
    };
    let pow2: u32 = match suffix {
        "Ki" => 10,
        "Mi" => 20,
        "Gi" => 30,
        "Ti" => 40,
        "Pi" => 50,
        "Ei" => 60,
        _ => 0,
    };
    // shift to nano-units
    let exp10 = suffix_exp.checked_sub(frac_len).and_then(|e| e.checked_add(9)).ok_or_else(bad)?;

    let scaled = mantissa.checked_mul(1i128 << pow2).ok_or_else(bad)?;
    let nano = if exp10 >= 0 {
        10i128.checked_pow(exp10.unsigned_abs()).and_then(|p| scaled.checked_mul(p)).ok_or_else(bad)?
    } else {
        match 10i128.checked_pow(exp10.unsigned_abs()) {
            Some(p) => scaled.checked_add(p - 1).ok_or_else(bad)? / p,
            // smaller than one nano-unit: rounds up to one unless zero
            None => i128::from(scaled != 0),
        }
    };
    Ok(if negative { -nano } else { nano })
}

/// Whole units, rounded up.
fn ceil_units(nano: i128) -> Result<i128, NodeError> {
    nano.checked_add(NANO - 1)
        .map(|n| n.div_euclid(NANO))
        .ok_or_else(|| NodeError::Quantity(format!("{}n", nano)))
}

/// Render a byte count with the largest binary suffix that keeps it exact.
pub fn format_binary(bytes: i128) -> String {
    const SUFFIXES: [(&str, u32); 6] = [("Ei", 60), ("Pi", 50), ("Ti", 40), ("Gi", 30), ("Mi", 20), ("Ki", 10)];
    if bytes == 0 {
        return "0".to_string();
    }
    for (suffix, shift) in SUFFIXES {
        let unit = 1i128 << shift;
        if bytes % unit == 0 {
            return format!("{}{}", bytes / unit, suffix);
        }
    }
    bytes.to_string()
}

/// Result of planning a node update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPlan {
    /// Annotations to record (only those that were missing).
    pub record: BTreeMap<String, String>,
    pub cpu: String,
    pub memory: String,
}

/// Decide whether a node needs scaling and compute the new values.
///
/// `cpu` / `memory` are the live `status.allocatable` quantities.
pub fn plan_capacity(
    annotations: &BTreeMap<String, String>,
    cpu: &str,
    memory: &str,
    multiple: u32,
) -> Result<Option<CapacityPlan>, NodeError> {
    let cpu_nano = parse_quantity(cpu)?;
    let mem_nano = parse_quantity(memory)?;

    let mut record = BTreeMap::new();
    let mut needed = false;
    for (key, live_raw, live) in [(CPU_ANNOTATION, cpu, cpu_nano), (MEM_ANNOTATION, memory, mem_nano)] {
        match annotations.get(key).filter(|v| !v.is_empty()) {
            None => {
                record.insert(key.to_string(), live_raw.to_string());
                needed = true;
            }
            Some(recorded) => {
                if parse_quantity(recorded).map(|v| v == live).unwrap_or(false) {
                    needed = true;
                }
            }
        }
    }
    if !needed {
        return Ok(None);
    }

    let m = i128::from(multiple);
    let overflow = |q: &str| NodeError::Quantity(q.to_string());
    let cpu_out = ceil_units(cpu_nano)?.checked_mul(m).ok_or_else(|| overflow(cpu))?;
    let mem_out = ceil_units(mem_nano)?.checked_mul(m).ok_or_else(|| overflow(memory))?;
    Ok(Some(CapacityPlan { record, cpu: cpu_out.to_string(), memory: format_binary(mem_out) }))
}

struct NodeContext {
    api: Api<Node>,
    multiple: u32,
    resync: Duration,
}

async fn apply(api: &Api<Node>, name: &str, multiple: u32) -> Result<bool, NodeError> {
    let Some(node) = api.get_opt(name).await? else {
        debug!(node = %name, "node gone");
        return Ok(false);
    };
    let allocatable = node.status.as_ref().and_then(|s| s.allocatable.as_ref());
    let get = |k: &str| allocatable.and_then(|a| a.get(k)).map(|q| q.0.clone());
    let (Some(cpu), Some(memory)) = (get("cpu"), get("memory")) else {
        debug!(node = %name, "no allocatable cpu/memory yet");
        return Ok(false);
    };
    let annotations = node.metadata.annotations.clone().unwrap_or_default();
    let Some(plan) = plan_capacity(&annotations, &cpu, &memory, multiple)? else {
        debug!(node = %name, "capacity already scaled");
        return Ok(false);
    };

    let pp = PatchParams::default();
    if !plan.record.is_empty() {
        let meta = json!({ "metadata": { "annotations": plan.record } });
        api.patch(name, &pp, &Patch::Merge(&meta)).await?;
    }
    let resources = json!({ "cpu": Quantity(plan.cpu.clone()), "memory": Quantity(plan.memory.clone()) });
    let status = json!({ "status": { "allocatable": resources.clone(), "capacity": resources } });
    api.patch_status(name, &pp, &Patch::Merge(&status)).await?;
    counter!("node_capacity_patched_total", 1u64);
    info!(node = %name, cpu_from = %cpu, cpu_to = %plan.cpu, mem_from = %memory, mem_to = %plan.memory, "capacity scaled");
    Ok(true)
}

async fn reconcile(node: Arc<Node>, ctx: Arc<NodeContext>) -> Result<Action, NodeError> {
    let name = node.metadata.name.clone().unwrap_or_default();
    apply(&ctx.api, &name, ctx.multiple).await?;
    Ok(Action::requeue(ctx.resync))
}

fn error_policy(node: Arc<Node>, err: &NodeError, ctx: Arc<NodeContext>) -> Action {
    warn!(node = %node.metadata.name.as_deref().unwrap_or(""), error = ?err, "node capacity update failed");
    Action::requeue(ctx.resync)
}

/// Controller watching all nodes.
pub fn node_controller(client: Client, multiple: u32, resync: Duration) -> BoxFuture<'static, ()> {
    let api: Api<Node> = Api::all(client);
    info!(multiple, "node capacity controller wired");
    let ctx = Arc::new(NodeContext { api: api.clone(), multiple, resync });
    Controller::new(api, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| {
            if let Err(e) = res {
                debug!(error = %e, "node controller event error");
            }
            futures::future::ready(())
        })
        .boxed()
}
