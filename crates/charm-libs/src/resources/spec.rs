//! Resource spec validation and normalization
//!
//! A [`ResourceSpec`] is what the caller declares (from charm config, say);
//! a [`NormalizedResourceSpec`] is what actually gets sent to the cluster.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::ResourceRequirements as K8sResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::quantity::{equals_canonically, Quantity};
use crate::error::SpecError;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";

/// Keys accepted in a resource spec, in output order
pub const RESOURCE_KEYS: [&str; 2] = [CPU, MEMORY];

/// Caller-declared resource spec: resource name to optional quantity string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceSpec(BTreeMap<String, Option<String>>);

impl ResourceSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cpu(self, value: impl Into<String>) -> Self {
        self.with(CPU, value)
    }

    pub fn memory(self, value: impl Into<String>) -> Self {
        self.with(MEMORY, value)
    }

    /// Set an arbitrary key; unknown keys are kept so validation can reject them
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), Some(value.into()));
        self
    }

    /// Declare a key explicitly without a value ("no limit")
    pub fn unset(mut self, key: impl Into<String>) -> Self {
        self.0.insert(key.into(), None);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<String>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResourceSpec {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        )
    }
}

impl From<NormalizedResourceSpec> for ResourceSpec {
    fn from(spec: NormalizedResourceSpec) -> Self {
        spec.0.into_iter().collect()
    }
}

impl fmt::Display for ResourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| match v {
                Some(v) => format!("{k}: {v:?}"),
                None => format!("{k}: None"),
            })
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

/// A sanitized resource spec: only non-empty values, whole-byte memory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedResourceSpec(BTreeMap<String, String>);

impl NormalizedResourceSpec {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Canonical comparison: same keys, canonically equal quantities
    pub fn equals_canonically(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self.0.iter().all(|(k, v)| {
                other
                    .0
                    .get(k)
                    .map(|o| equals_canonically(v, o))
                    .unwrap_or(false)
            })
    }

    fn to_k8s(&self) -> Option<BTreeMap<String, K8sQuantity>> {
        if self.0.is_empty() {
            return None;
        }
        Some(
            self.0
                .iter()
                .map(|(k, v)| (k.clone(), K8sQuantity(v.clone())))
                .collect(),
        )
    }

    fn from_k8s(map: Option<&BTreeMap<String, K8sQuantity>>) -> Self {
        Self(
            map.map(|m| m.iter().map(|(k, v)| (k.clone(), v.0.clone())).collect())
                .unwrap_or_default(),
        )
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for NormalizedResourceSpec {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// The limits/requests pair compared against and applied to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub limits: NormalizedResourceSpec,
    pub requests: NormalizedResourceSpec,
}

impl ResourceRequirements {
    pub fn new(limits: NormalizedResourceSpec, requests: NormalizedResourceSpec) -> Self {
        Self { limits, requests }
    }

    /// Validate and sanitize a raw limits/requests pair
    pub fn from_specs(
        limits: Option<&ResourceSpec>,
        requests: Option<&ResourceSpec>,
    ) -> Result<Self, SpecError> {
        if !is_valid_spec(limits) {
            return Err(SpecError::InvalidLimits(display_opt(limits)));
        }
        if !is_valid_spec(requests) {
            return Err(SpecError::InvalidRequests(display_opt(requests)));
        }
        Ok(Self {
            limits: sanitize_opt(limits),
            requests: sanitize_opt(requests),
        })
    }

    /// Structural equality after canonicalizing quantity strings
    pub fn is_converged(&self, observed: &ResourceRequirements) -> bool {
        self.limits.equals_canonically(&observed.limits)
            && self.requests.equals_canonically(&observed.requests)
    }

    pub fn to_k8s(&self) -> K8sResourceRequirements {
        K8sResourceRequirements {
            limits: self.limits.to_k8s(),
            requests: self.requests.to_k8s(),
            ..Default::default()
        }
    }

    pub fn from_k8s(reqs: Option<&K8sResourceRequirements>) -> Self {
        Self {
            limits: NormalizedResourceSpec::from_k8s(reqs.and_then(|r| r.limits.as_ref())),
            requests: NormalizedResourceSpec::from_k8s(reqs.and_then(|r| r.requests.as_ref())),
        }
    }
}

impl fmt::Display for ResourceRequirements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "limits={:?}, requests={:?}", self.limits.0, self.requests.0)
    }
}

fn display_opt(spec: Option<&ResourceSpec>) -> String {
    spec.map(|s| s.to_string()).unwrap_or_else(|| "None".to_string())
}

fn sanitize_opt(spec: Option<&ResourceSpec>) -> NormalizedResourceSpec {
    spec.map(sanitize_resource_spec).unwrap_or_default()
}

/// Check that a spec only has known keys and non-negative quantities
///
/// `None`, missing values and empty strings are all valid: they mean "no limit".
/// Never fails; reasons are logged at debug level.
pub fn is_valid_spec(spec: Option<&ResourceSpec>) -> bool {
    let Some(spec) = spec else {
        return true;
    };

    for (key, value) in spec.iter() {
        if !RESOURCE_KEYS.contains(&key.as_str()) {
            debug!(key = %key, value = ?value, "Invalid resource spec entry: unknown key");
            return false;
        }

        let Some(value) = value.as_deref().filter(|v| !v.is_empty()) else {
            continue;
        };

        match Quantity::parse(value) {
            Ok(q) if q.is_negative() => {
                debug!(key = %key, value = %value, "Invalid resource spec entry: must be non-negative");
                return false;
            }
            Ok(_) => {}
            Err(_) => {
                debug!(key = %key, value = %value, "Invalid resource spec entry: not a quantity");
                return false;
            }
        }
    }

    true
}

/// Fix spec values without altering their meaning
///
/// Empty values are dropped: an empty string would otherwise reach the
/// StatefulSet as a `0` setpoint and the pod would never schedule. Memory is
/// rounded up to whole bytes since fractional byte values are rejected by
/// the API server.
pub fn sanitize_resource_spec(spec: &ResourceSpec) -> NormalizedResourceSpec {
    let mut out = NormalizedResourceSpec::default();

    for (key, value) in spec.iter() {
        if let Some(v) = value.as_deref().filter(|v| !v.is_empty()) {
            out.insert(key.clone(), v);
        }
    }

    let rounded = out
        .get(MEMORY)
        .and_then(|memory| Quantity::parse(memory).ok())
        .filter(Quantity::has_fraction)
        .map(|q| q.ceil().to_plain_string());
    if let Some(rounded) = rounded {
        out.insert(MEMORY, rounded);
    }

    out
}

/// Two-ray piecewise-linear function with unit slope for the first ray
///
/// - `x` when `x <= default`
/// - `default` when `default < x <= default / factor`
/// - `factor * x` beyond that
///
/// A `default / factor` too large to represent is an unbounded plateau.
fn two_ray(x: Decimal, default: Decimal, factor: Decimal) -> Decimal {
    if x <= default {
        return x;
    }
    let on_plateau = match default.checked_div(factor) {
        Some(bound) => x <= bound,
        None => true,
    };
    if on_plateau {
        return default;
    }
    factor * x
}

/// Derive "requests" from "limits" with a scaling factor
///
/// Requests track small limits one-to-one, plateau at the default, then scale
/// down proportionally for large limits so bursty workloads keep headroom.
/// Only keys present in `default_requests` produce a request; a key missing
/// from `limits` takes the default.
pub fn requests_from_limits(
    limits: Option<&ResourceSpec>,
    default_requests: Option<&ResourceSpec>,
    scaling_factor: Decimal,
) -> Result<NormalizedResourceSpec, SpecError> {
    if scaling_factor <= Decimal::ZERO || scaling_factor >= Decimal::ONE {
        return Err(SpecError::ScalingFactorOutOfRange(scaling_factor.to_string()));
    }

    let reqs = ResourceRequirements::from_specs(limits, default_requests)?;
    let mut requests = NormalizedResourceSpec::default();

    for key in RESOURCE_KEYS {
        let Some(default) = reqs.requests.get(key) else {
            continue;
        };
        let default = Quantity::parse(default)?.as_decimal();
        let value = match reqs.limits.get(key) {
            Some(limit) => two_ray(Quantity::parse(limit)?.as_decimal(), default, scaling_factor),
            None => default,
        };
        requests.insert(key, Quantity::from_decimal(value).to_milli_string());
    }

    Ok(requests)
}

/// Make limits and requests consistent with each other
///
/// Keys present only in `limits` are copied into requests (as Kubernetes
/// itself would). When a limit is below its request, `adhere_to_requests`
/// decides which side moves: true raises the limit, false lowers the request.
pub fn adjust_resource_requirements(
    limits: Option<&ResourceSpec>,
    requests: Option<&ResourceSpec>,
    adhere_to_requests: bool,
) -> Result<ResourceRequirements, SpecError> {
    let ResourceRequirements {
        mut limits,
        mut requests,
    } = ResourceRequirements::from_specs(limits, requests)?;

    for (k, v) in limits.clone().iter() {
        if !requests.contains_key(k) {
            requests.insert(k.clone(), v.clone());
        }
    }

    let (fixed, adjusted) = if adhere_to_requests {
        (&requests, &mut limits)
    } else {
        (&limits, &mut requests)
    };

    let keys: Vec<String> = adjusted.iter().map(|(k, _)| k.clone()).collect();
    for key in keys {
        let (Some(fixed_value), Some(adjusted_value)) = (fixed.get(&key), adjusted.get(&key))
        else {
            continue;
        };
        let f = Quantity::parse(fixed_value)?;
        let a = Quantity::parse(adjusted_value)?;
        let replace = if adhere_to_requests { f > a } else { f < a };
        if replace {
            let value = fixed_value.to_string();
            adjusted.insert(key, value);
        }
    }

    Ok(ResourceRequirements { limits, requests })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sf(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn spec(pairs: &[(&str, &str)]) -> ResourceSpec {
        pairs.iter().copied().collect()
    }

    fn normalized(pairs: &[(&str, &str)]) -> NormalizedResourceSpec {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_is_valid_spec() {
        assert!(is_valid_spec(None));
        assert!(is_valid_spec(Some(&ResourceSpec::new())));
        assert!(is_valid_spec(Some(&spec(&[("cpu", "1")]))));
        assert!(is_valid_spec(Some(&spec(&[("memory", "858993460")]))));
        assert!(is_valid_spec(Some(&spec(&[("memory", "0.8Gi")]))));
        assert!(is_valid_spec(Some(&ResourceSpec::new().unset("cpu").unset("memory"))));
        assert!(is_valid_spec(Some(&spec(&[("cpu", ""), ("memory", "1Gi")]))));

        assert!(!is_valid_spec(Some(&spec(&[("bad", "combo")]))));
        assert!(!is_valid_spec(Some(&spec(&[("invalid-key", "1")]))));
        assert!(!is_valid_spec(Some(&spec(&[("cpu", "-1")]))));
        assert!(!is_valid_spec(Some(&spec(&[("memory", "-1Gi")]))));
        assert!(!is_valid_spec(Some(&spec(&[("cpu", "4x")]))));
        assert!(!is_valid_spec(Some(&spec(&[("memory", "1Gx")]))));
    }

    #[test]
    fn test_sanitize_drops_empty_and_rounds_memory() {
        assert_eq!(sanitize_resource_spec(&ResourceSpec::new()), normalized(&[]));
        assert_eq!(
            sanitize_resource_spec(&spec(&[("cpu", "1")])),
            normalized(&[("cpu", "1")])
        );
        assert_eq!(
            sanitize_resource_spec(&spec(&[("memory", "0.8Gi")])),
            normalized(&[("memory", "858993460")])
        );
        assert_eq!(
            sanitize_resource_spec(&spec(&[("cpu", ""), ("memory", "1Gi")])),
            normalized(&[("memory", "1Gi")])
        );
        assert_eq!(
            sanitize_resource_spec(&ResourceSpec::new().unset("cpu")),
            normalized(&[])
        );
    }

    #[test]
    fn test_sanitize_is_idempotent_and_stays_valid() {
        let inputs = [
            spec(&[("cpu", "250m"), ("memory", "0.8Gi")]),
            spec(&[("memory", "1.5")]),
            spec(&[("cpu", ""), ("memory", "")]),
            spec(&[("cpu", "2"), ("memory", "3Mi")]),
        ];
        for input in inputs {
            assert!(is_valid_spec(Some(&input)));
            let once = sanitize_resource_spec(&input);
            let twice = sanitize_resource_spec(&ResourceSpec::from(once.clone()));
            assert_eq!(once, twice);
            assert!(is_valid_spec(Some(&ResourceSpec::from(once))));
        }
    }

    #[test]
    fn test_requests_from_limits_two_ray() {
        let f = sf("0.8");
        let default = spec(&[("cpu", "200m")]);
        let cases = [
            ("1", "0.800"),
            ("260m", "0.208"),
            ("250m", "0.200"),
            ("200m", "0.200"),
            ("150m", "0.150"),
        ];
        for (limit, expected) in cases {
            let out = requests_from_limits(Some(&spec(&[("cpu", limit)])), Some(&default), f).unwrap();
            assert_eq!(out, normalized(&[("cpu", expected)]), "limit {limit}");
        }

        // sub-milli input is only rounded after the branch is chosen
        let out = requests_from_limits(
            Some(&spec(&[("cpu", "1.0001m")])),
            Some(&spec(&[("cpu", "1m")])),
            f,
        )
        .unwrap();
        assert_eq!(out, normalized(&[("cpu", "0.001")]));
    }

    #[test]
    fn test_requests_from_limits_tiny_factor_does_not_overflow() {
        let out = requests_from_limits(
            Some(&spec(&[("memory", "2Pi")])),
            Some(&spec(&[("memory", "1Pi")])),
            Decimal::new(1, 14),
        )
        .unwrap();
        assert_eq!(out, normalized(&[("memory", "1125899906842624.000")]));
    }

    #[test]
    fn test_requests_from_limits_uses_default_when_limit_missing() {
        let out = requests_from_limits(
            Some(&spec(&[("cpu", "1")])),
            Some(&spec(&[("cpu", "200m"), ("memory", "1Gi")])),
            sf("0.8"),
        )
        .unwrap();
        assert_eq!(out.get("cpu"), Some("0.800"));
        assert_eq!(out.get("memory"), Some("1073741824.000"));
    }

    #[test]
    fn test_requests_from_limits_only_keys_with_defaults() {
        let out = requests_from_limits(
            Some(&spec(&[("cpu", "1"), ("memory", "2Gi")])),
            Some(&spec(&[("cpu", "200m")])),
            sf("0.5"),
        )
        .unwrap();
        assert_eq!(out, normalized(&[("cpu", "0.500")]));
    }

    #[test]
    fn test_requests_from_limits_rejects_bad_scaling_factor() {
        for bad in ["0", "1", "1.5", "-0.2"] {
            let err = requests_from_limits(None, None, sf(bad)).unwrap_err();
            assert!(matches!(err, SpecError::ScalingFactorOutOfRange(_)));
        }
    }

    #[test]
    fn test_requests_from_limits_rejects_invalid_specs() {
        let err = requests_from_limits(Some(&spec(&[("gpu", "1")])), None, sf("0.8")).unwrap_err();
        assert!(matches!(err, SpecError::InvalidLimits(_)));
        let err = requests_from_limits(None, Some(&spec(&[("cpu", "-1")])), sf("0.8")).unwrap_err();
        assert!(matches!(err, SpecError::InvalidRequests(_)));
    }

    #[test]
    fn test_requests_monotonic_and_bounded_below() {
        let default = Decimal::new(200, 3);
        let f = sf("0.8");
        let mut previous = Decimal::ZERO;
        for millis in (0..2000).step_by(7) {
            let limit = format!("{millis}m");
            let out = requests_from_limits(
                Some(&spec(&[("cpu", &limit)])),
                Some(&spec(&[("cpu", "200m")])),
                f,
            )
            .unwrap();
            let value: Decimal = out.get("cpu").unwrap().parse().unwrap();
            let x = Decimal::new(millis, 3);
            assert!(value >= previous, "not monotonic at {limit}");
            assert!(value >= x.min(default), "below min(limit, default) at {limit}");
            previous = value;
        }
    }

    #[test]
    fn test_adjust_resource_requirements() {
        let r = adjust_resource_requirements(Some(&spec(&[])), Some(&spec(&[])), true).unwrap();
        assert!(r.limits.is_empty() && r.requests.is_empty());

        let r = adjust_resource_requirements(Some(&spec(&[("cpu", "1")])), None, true).unwrap();
        assert_eq!(r.limits, normalized(&[("cpu", "1")]));
        assert_eq!(r.requests, normalized(&[("cpu", "1")]));

        let l = spec(&[("cpu", "1")]);
        let q = spec(&[("cpu", "2")]);
        let r = adjust_resource_requirements(Some(&l), Some(&q), true).unwrap();
        assert_eq!(r.limits, normalized(&[("cpu", "2")]));
        assert_eq!(r.requests, normalized(&[("cpu", "2")]));

        let r = adjust_resource_requirements(Some(&l), Some(&q), false).unwrap();
        assert_eq!(r.limits, normalized(&[("cpu", "1")]));
        assert_eq!(r.requests, normalized(&[("cpu", "1")]));

        let r = adjust_resource_requirements(Some(&l), Some(&spec(&[("memory", "1G")])), true)
            .unwrap();
        assert_eq!(r.limits, normalized(&[("cpu", "1")]));
        assert_eq!(r.requests, normalized(&[("cpu", "1"), ("memory", "1G")]));

        let err = adjust_resource_requirements(
            Some(&spec(&[("custom-resource", "1")])),
            Some(&spec(&[("custom-resource", "2")])),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, SpecError::InvalidLimits(_)));
    }

    #[test]
    fn test_convergence_is_canonical() {
        let desired = ResourceRequirements::new(
            normalized(&[("cpu", "1"), ("memory", "1Gi")]),
            normalized(&[("cpu", "500m")]),
        );
        let observed = ResourceRequirements::new(
            normalized(&[("cpu", "1000m"), ("memory", "1073741824")]),
            normalized(&[("cpu", "0.5")]),
        );
        assert!(desired.is_converged(&observed));

        let drifted = ResourceRequirements::new(
            normalized(&[("cpu", "2")]),
            normalized(&[("cpu", "500m")]),
        );
        assert!(!desired.is_converged(&drifted));
    }

    #[test]
    fn test_k8s_round_trip_treats_empty_as_absent() {
        let empty = ResourceRequirements::default();
        let k8s = empty.to_k8s();
        assert!(k8s.limits.is_none() && k8s.requests.is_none());
        assert!(empty.is_converged(&ResourceRequirements::from_k8s(None)));
    }
}
