//! Geo enrichment for client data records.
//!
//! [`GeoEnricher`] wraps a [`GeoResolver`] and never fails: errors,
//! timeouts and empty results all collapse into the unknown location.

use crate::GeoError;
use async_trait::async_trait;
use maxminddb::{MaxMindDBError, Reader};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Value used for every component that could not be resolved.
pub const UNKNOWN: &str = "unknown";

/// Country, region and city of an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: String,
    pub region: String,
    pub city: String,
}

impl GeoLocation {
    /// Create a location.
    pub fn new(
        country: impl Into<String>,
        region: impl Into<String>,
        city: impl Into<String>,
    ) -> Self {
        Self {
            country: country.into(),
            region: region.into(),
            city: city.into(),
        }
    }

    /// The ("unknown", "unknown", "unknown") sentinel.
    pub fn unknown() -> Self {
        Self::new(UNKNOWN, UNKNOWN, UNKNOWN)
    }

    /// Whether every component is unknown.
    pub fn is_unknown(&self) -> bool {
        self.country == UNKNOWN && self.region == UNKNOWN && self.city == UNKNOWN
    }

    /// Replace each empty component with "unknown".
    fn normalized(self) -> Self {
        let or_unknown = |value: String| {
            if value.trim().is_empty() {
                UNKNOWN.to_string()
            } else {
                value
            }
        };
        Self {
            country: or_unknown(self.country),
            region: or_unknown(self.region),
            city: or_unknown(self.city),
        }
    }
}

/// Address to location lookup service.
#[async_trait]
pub trait GeoResolver: Send + Sync {
    /// Resolve an address. May fail for any reason.
    async fn resolve(&self, address: &str) -> Result<GeoLocation, GeoError>;
}

/// Infallible geo lookup with a per-call time budget.
pub struct GeoEnricher {
    resolver: Arc<dyn GeoResolver>,
    timeout: Duration,
    failures: AtomicU64,
}

impl GeoEnricher {
    /// Wrap a resolver.
    pub fn new(resolver: Arc<dyn GeoResolver>, timeout: Duration) -> Self {
        Self {
            resolver,
            timeout,
            failures: AtomicU64::new(0),
        }
    }

    /// Resolve `address`, falling back to [`GeoLocation::unknown`].
    pub async fn lookup(&self, address: &str) -> GeoLocation {
        let outcome = match tokio::time::timeout(self.timeout, self.resolver.resolve(address)).await
        {
            Ok(result) => result,
            Err(_) => Err(GeoError::Timeout(self.timeout.as_millis() as u64)),
        };

        match outcome {
            Ok(location) => location.normalized(),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(address = %address, error = %e, "Geo lookup failed, using unknown location");
                GeoLocation::unknown()
            }
        }
    }

    /// Number of lookups that fell back to the unknown location.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Resolver used when no geo database is configured.
pub struct UnavailableResolver;

#[async_trait]
impl GeoResolver for UnavailableResolver {
    async fn resolve(&self, _address: &str) -> Result<GeoLocation, GeoError> {
        Err(GeoError::Unavailable("no geo database configured".into()))
    }
}

/// Resolver over a MaxMind City database (`.mmdb`).
///
/// Names are read in `locale`; the region is the first (largest)
/// subdivision.
pub struct MaxMindResolver {
    reader: Reader<Vec<u8>>,
    locale: String,
}

impl MaxMindResolver {
    /// Open the database at `path`.
    pub fn open(path: &Path, locale: impl Into<String>) -> crate::Result<Self> {
        debug!(path = %path.display(), "Opening geo database");
        let reader = Reader::open_readfile(path).map_err(|e| {
            crate::Error::Config(format!(
                "Cannot open geo database {}: {}",
                path.display(),
                e
            ))
        })?;
        info!(
            path = %path.display(),
            database_type = %reader.metadata.database_type,
            "Geo database opened"
        );
        Ok(Self {
            reader,
            locale: locale.into(),
        })
    }

    fn parse_ip(address: &str) -> Result<IpAddr, GeoError> {
        let ip = IpAddr::from_str(address.trim())
            .map_err(|_| GeoError::InvalidAddress(address.to_string()))?;
        if ip.is_loopback() || ip.is_unspecified() {
            return Err(GeoError::NotFound(address.to_string()));
        }
        Ok(ip)
    }
}

#[async_trait]
impl GeoResolver for MaxMindResolver {
    async fn resolve(&self, address: &str) -> Result<GeoLocation, GeoError> {
        let ip = Self::parse_ip(address)?;
        match self.reader.lookup::<Value>(ip) {
            Ok(city) => Ok(location_from_city(&city, &self.locale)),
            Err(MaxMindDBError::AddressNotFoundError(_)) => {
                Err(GeoError::NotFound(address.to_string()))
            }
            Err(e) => Err(GeoError::Unavailable(e.to_string())),
        }
    }
}

/// Country, first subdivision and city names of a City record. Missing
/// names are left empty for the enricher to replace.
fn location_from_city(city: &Value, locale: &str) -> GeoLocation {
    let name = |pointer: String| {
        city.pointer(&pointer)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    GeoLocation::new(
        name(format!("/country/names/{}", locale)),
        name(format!("/subdivisions/0/names/{}", locale)),
        name(format!("/city/names/{}", locale)),
    )
}
