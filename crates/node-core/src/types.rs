use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Workload kinds a node knows how to provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationType {
    Container,
    Volume,
    Network,
    NetworkResource,
    Zdb,
    Debug,
    Kubernetes,
}

impl ReservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationType::Container => "container",
            ReservationType::Volume => "volume",
            ReservationType::Network => "network",
            ReservationType::NetworkResource => "network_resource",
            ReservationType::Zdb => "zdb",
            ReservationType::Debug => "debug",
            ReservationType::Kubernetes => "kubernetes",
        }
    }

    /// Dispatch priority within one poll cycle. Lower goes first, so that
    /// networks and storage exist before the containers and VMs that use them.
    pub fn provision_priority(&self) -> u8 {
        match self {
            ReservationType::Network => 0,
            ReservationType::NetworkResource => 1,
            ReservationType::Volume => 2,
            ReservationType::Zdb => 3,
            ReservationType::Container => 4,
            ReservationType::Kubernetes => 5,
            ReservationType::Debug => 6,
        }
    }
}

/// A unit of work assigned to this node by the remote registry.
///
/// Immutable once issued; identified solely by `id`. The `data` payload is
/// opaque at this level and interpreted by the type-specific handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub node_id: String,
    #[serde(rename = "type")]
    pub reservation_type: ReservationType,
    #[serde(default)]
    pub data: serde_json::Value,
    pub created: DateTime<Utc>,
    /// Requested lifetime in seconds. Zero or negative means no local expiry.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub to_delete: bool,
}

impl Reservation {
    pub fn expiration(&self) -> Option<DateTime<Utc>> {
        if self.duration <= 0 {
            None
        } else {
            Some(self.created + Duration::seconds(self.duration))
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration().map(|exp| exp <= now).unwrap_or(false)
    }

    /// Debug reservations are scratch state; they are purged from the cache
    /// on the first boot after an upgrade.
    pub fn persistent(&self) -> bool {
        self.reservation_type != ReservationType::Debug
    }
}

/// Outcome state of a provisioning attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultState {
    Ok,
    Error,
}

impl ResultState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultState::Ok => "ok",
            ResultState::Error => "error",
        }
    }
}

/// The recorded outcome of attempting a reservation. At most one exists per
/// reservation id; the cache layer enforces that.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationResult {
    pub id: String,
    #[serde(rename = "type")]
    pub reservation_type: ReservationType,
    pub created: DateTime<Utc>,
    pub state: ResultState,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl ReservationResult {
    pub fn ok(reservation: &Reservation, data: serde_json::Value) -> Self {
        Self {
            id: reservation.id.clone(),
            reservation_type: reservation.reservation_type,
            created: Utc::now(),
            state: ResultState::Ok,
            error: String::new(),
            data,
        }
    }

    pub fn error(reservation: &Reservation, message: impl Into<String>) -> Self {
        Self {
            id: reservation.id.clone(),
            reservation_type: reservation.reservation_type,
            created: Utc::now(),
            state: ResultState::Error,
            error: message.into(),
            data: serde_json::Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.state == ResultState::Ok
    }
}

/// Node resource units: virtual cores, memory, SSD and HDD storage (GiB).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUnits {
    pub cru: u64,
    pub mru: u64,
    pub sru: u64,
    pub hru: u64,
}

impl ResourceUnits {
    pub fn add(&mut self, other: &ResourceUnits) {
        self.cru += other.cru;
        self.mru += other.mru;
        self.sru += other.sru;
        self.hru += other.hru;
    }

    pub fn subtract(&mut self, other: &ResourceUnits) {
        self.cru = self.cru.saturating_sub(other.cru);
        self.mru = self.mru.saturating_sub(other.mru);
        self.sru = self.sru.saturating_sub(other.sru);
        self.hru = self.hru.saturating_sub(other.hru);
    }

    /// True if this footprint fits on top of `used` without exceeding `total`.
    pub fn fits_within(&self, used: &ResourceUnits, total: &ResourceUnits) -> bool {
        used.cru + self.cru <= total.cru
            && used.mru + self.mru <= total.mru
            && used.sru + self.sru <= total.sru
            && used.hru + self.hru <= total.hru
    }

    pub fn is_zero(&self) -> bool {
        *self == ResourceUnits::default()
    }
}

impl std::fmt::Display for ResourceUnits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cru={} mru={} sru={} hru={}",
            self.cru, self.mru, self.sru, self.hru
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_priority_orders_dependencies_first() {
        assert!(
            ReservationType::Network.provision_priority()
                < ReservationType::Volume.provision_priority()
        );
        assert!(
            ReservationType::Volume.provision_priority()
                < ReservationType::Container.provision_priority()
        );
        assert!(
            ReservationType::Zdb.provision_priority()
                < ReservationType::Kubernetes.provision_priority()
        );
    }

    #[test]
    fn expiration_from_duration() {
        let created = Utc::now() - Duration::seconds(120);
        let reservation = Reservation {
            id: "r1".into(),
            node_id: "node".into(),
            reservation_type: ReservationType::Volume,
            data: serde_json::Value::Null,
            created,
            duration: 60,
            to_delete: false,
        };
        assert!(reservation.expired(Utc::now()));

        let open_ended = Reservation {
            duration: 0,
            ..reservation
        };
        assert!(!open_ended.expired(Utc::now()));
    }

    #[test]
    fn units_fit_and_saturate() {
        let total = ResourceUnits {
            cru: 4,
            mru: 8,
            sru: 100,
            hru: 0,
        };
        let mut used = ResourceUnits::default();
        let volume = ResourceUnits {
            sru: 10,
            ..Default::default()
        };

        assert!(volume.fits_within(&used, &total));
        used.add(&volume);
        assert_eq!(used.sru, 10);

        let too_big = ResourceUnits {
            sru: 200,
            ..Default::default()
        };
        assert!(!too_big.fits_within(&used, &total));

        used.subtract(&ResourceUnits {
            sru: 50,
            ..Default::default()
        });
        assert_eq!(used.sru, 0);
    }

    #[test]
    fn reservation_type_round_trips_snake_case() {
        let json = serde_json::to_string(&ReservationType::NetworkResource).unwrap();
        assert_eq!(json, "\"network_resource\"");
        let back: ReservationType = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ReservationType::NetworkResource);
    }
}
