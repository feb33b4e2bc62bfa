//! Status conditions for BoundEndpoints.
//!
//! `Ready` is never set directly; it is derived from `ServicesCreated` and
//! `ConnectivityVerified`.

#[cfg(not(test))]
use chrono::offset::Utc;
use binding_controller_k8s_api::{Condition, ConditionStatus};

pub const SERVICES_CREATED: &str = "ServicesCreated";
pub const CONNECTIVITY_VERIFIED: &str = "ConnectivityVerified";
pub const READY: &str = "Ready";

pub mod reason {
    pub const SERVICES_CREATED: &str = "ServicesCreated";
    pub const SERVICES_NOT_CREATED: &str = "ServicesNotCreated";
    pub const SERVICE_CREATION_FAILED: &str = "ServiceCreationFailed";
    pub const CONNECTIVITY_VERIFIED: &str = "ConnectivityVerified";
    pub const CONNECTIVITY_NOT_VERIFIED: &str = "ConnectivityNotVerified";
    pub const CONNECTIVITY_FAILED: &str = "ConnectivityFailed";
    pub const READY: &str = "BoundEndpointReady";
    pub const DENIED: &str = "Denied";
}

/// Stable codes recorded on endpoint refs whose binding failed.
pub mod error_code {
    pub const DENIED: &str = "ERR_BINDING_DENIED";
    pub const SERVICE_CREATION_FAILED: &str = "ERR_BINDING_SERVICE_CREATION_FAILED";
    pub const CONNECTIVITY_FAILED: &str = "ERR_BINDING_CONNECTIVITY_FAILED";
}

/// Builds a condition stamped with the current time.
pub fn new(
    typ: &str,
    ok: bool,
    reason: &str,
    message: impl Into<String>,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        typ: typ.to_string(),
        status: ok.into(),
        reason: reason.to_string(),
        message: normalize_message(&message.into()),
        observed_generation,
        last_transition_time: Some(now()),
    }
}

pub fn find<'c>(conditions: &'c [Condition], typ: &str) -> Option<&'c Condition> {
    conditions.iter().find(|c| c.typ == typ)
}

pub fn is_true(conditions: &[Condition], typ: &str) -> bool {
    find(conditions, typ).is_some_and(|c| c.status == ConditionStatus::True)
}

/// Inserts or replaces the condition of the same type, keeping the previous
/// transition time if the status didn't change.
pub fn set(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.typ == condition.typ) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.take();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}

/// Derives `Ready` from the two sub-conditions.
///
/// Ready is true only when both are true. Otherwise it copies the reason and
/// message of the first failing sub-condition, checking ServicesCreated first.
pub fn derive_ready(
    services_created: Option<&Condition>,
    connectivity_verified: Option<&Condition>,
    observed_generation: Option<i64>,
) -> Condition {
    let ok = |c: Option<&Condition>| c.is_some_and(|c| c.status == ConditionStatus::True);

    if ok(services_created) && ok(connectivity_verified) {
        return new(
            READY,
            true,
            reason::READY,
            "BoundEndpoint is ready",
            observed_generation,
        );
    }

    let (reason, message) = if !ok(services_created) {
        services_created
            .map(|c| (c.reason.as_str(), c.message.as_str()))
            .unwrap_or((reason::SERVICES_NOT_CREATED, "Services have not been created"))
    } else {
        connectivity_verified
            .map(|c| (c.reason.as_str(), c.message.as_str()))
            .unwrap_or((
                reason::CONNECTIVITY_NOT_VERIFIED,
                "Connectivity has not been verified",
            ))
    };
    new(READY, false, reason, message, observed_generation)
}

/// Collapses newlines and runs of whitespace into single spaces so that
/// remote error text is safe to store in status fields.
pub fn normalize_message(message: &str) -> String {
    message.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn now() -> String {
    #[cfg(not(test))]
    let timestamp = Utc::now();
    #[cfg(test)]
    let timestamp = chrono::DateTime::<chrono::Utc>::MIN_UTC;

    timestamp.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cond(typ: &str, ok: bool, reason: &str, message: &str) -> Condition {
        new(typ, ok, reason, message, Some(1))
    }

    #[test]
    fn ready_requires_both() {
        let services = cond(SERVICES_CREATED, true, reason::SERVICES_CREATED, "ok");
        let connectivity = cond(CONNECTIVITY_VERIFIED, true, reason::CONNECTIVITY_VERIFIED, "ok");
        let ready = derive_ready(Some(&services), Some(&connectivity), Some(1));
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.reason, reason::READY);
        assert_eq!(ready.typ, READY);
        assert_eq!(ready.observed_generation, Some(1));
    }

    #[test]
    fn services_failure_takes_precedence() {
        let services = cond(
            SERVICES_CREATED,
            false,
            reason::SERVICE_CREATION_FAILED,
            "quota exceeded",
        );
        for connectivity in [
            None,
            Some(cond(CONNECTIVITY_VERIFIED, true, reason::CONNECTIVITY_VERIFIED, "ok")),
            Some(cond(
                CONNECTIVITY_VERIFIED,
                false,
                reason::CONNECTIVITY_FAILED,
                "refused",
            )),
        ] {
            let ready = derive_ready(Some(&services), connectivity.as_ref(), Some(1));
            assert_eq!(ready.status, ConditionStatus::False);
            assert_eq!(ready.reason, reason::SERVICE_CREATION_FAILED);
            assert_eq!(ready.message, "quota exceeded");
        }
    }

    #[test]
    fn connectivity_failure_when_services_ok() {
        let services = cond(SERVICES_CREATED, true, reason::SERVICES_CREATED, "ok");
        let connectivity = cond(
            CONNECTIVITY_VERIFIED,
            false,
            reason::CONNECTIVITY_FAILED,
            "connection refused",
        );
        let ready = derive_ready(Some(&services), Some(&connectivity), None);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reason::CONNECTIVITY_FAILED);
        assert_eq!(ready.message, "connection refused");

        let ready = derive_ready(Some(&services), None, None);
        assert_eq!(ready.reason, reason::CONNECTIVITY_NOT_VERIFIED);
    }

    #[test]
    fn missing_conditions() {
        let ready = derive_ready(None, None, None);
        assert_eq!(ready.status, ConditionStatus::False);
        assert_eq!(ready.reason, reason::SERVICES_NOT_CREATED);
    }

    #[test]
    fn set_preserves_transition_time() {
        let mut conditions = Vec::new();
        let mut first = cond(SERVICES_CREATED, true, reason::SERVICES_CREATED, "ok");
        first.last_transition_time = Some("2024-01-01T00:00:00Z".to_string());
        set(&mut conditions, first);

        set(
            &mut conditions,
            cond(SERVICES_CREATED, true, reason::SERVICES_CREATED, "still ok"),
        );
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].message, "still ok");
        assert_eq!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );

        set(
            &mut conditions,
            cond(SERVICES_CREATED, false, reason::SERVICE_CREATION_FAILED, "no"),
        );
        assert_eq!(conditions[0].status, ConditionStatus::False);
        assert_ne!(
            conditions[0].last_transition_time.as_deref(),
            Some("2024-01-01T00:00:00Z")
        );

        set(&mut conditions, cond(READY, false, reason::DENIED, "denied"));
        assert_eq!(conditions.len(), 2);
        assert!(!is_true(&conditions, READY));
    }

    #[test]
    fn normalizes_messages() {
        assert_eq!(
            normalize_message("  failed to dial:\n\tconnection   refused \r\n"),
            "failed to dial: connection refused"
        );
        assert_eq!(normalize_message(""), "");
        assert_eq!(new(READY, false, "X", "a\n\nb", None).message, "a b");
    }
}
