//! Device identity resolution, cache-accelerated.

use std::sync::Arc;
use std::time::Duration;

use crate::db::{keys, CacheClient, DeviceIdentity, DeviceRepository};
use crate::error::{Error, Result};

/// Identity cache entries live this long.
pub const IDENTITY_TTL: Duration = Duration::from_secs(60 * 60);

/// Maps device addresses and ids to registered devices.
#[derive(Clone)]
pub struct DeviceResolver {
    devices: Arc<dyn DeviceRepository>,
    cache: Arc<dyn CacheClient>,
}

impl DeviceResolver {
    pub fn new(devices: Arc<dyn DeviceRepository>, cache: Arc<dyn CacheClient>) -> Self {
        Self { devices, cache }
    }

    /// Resolve a device by the address it pushes from.
    ///
    /// `NotFound` means the device is unregistered, not that a backend hiccuped.
    pub async fn resolve_by_address(&self, addr: &str) -> Result<DeviceIdentity> {
        let addr = addr.trim();
        if addr.is_empty() {
            return Err(Error::validation("address", "must not be empty"));
        }

        let key = keys::ip(addr);
        match self.cache.get_json::<DeviceIdentity>(&key).await {
            Ok(Some(identity)) => return Ok(identity),
            Ok(None) => {}
            Err(e) => tracing::warn!("Resolver: cache read failed for {}: {}", addr, e),
        }

        let device = self
            .devices
            .get_by_host(addr)
            .await?
            .ok_or_else(|| Error::NotFound(format!("device with address {}", addr)))?;
        let identity = DeviceIdentity::from(&device);

        if let Err(e) = self.cache.set_json(&key, &identity, Some(IDENTITY_TTL)).await {
            tracing::warn!("Resolver: failed to cache identity for {}: {}", addr, e);
        }
        Ok(identity)
    }

    /// Confirm a numeric device id is registered.
    pub async fn confirm_device(&self, device_id: i64) -> Result<()> {
        if device_id <= 0 {
            return Err(Error::validation("device_id", "must be a positive integer"));
        }

        let key = keys::exists(device_id);
        if let Ok(true) = self.cache.exists(&key).await {
            return Ok(());
        }

        if self.devices.get_by_id(device_id).await?.is_none() {
            return Err(Error::NotFound(format!("device {}", device_id)));
        }

        if let Err(e) = self.cache.set(&key, "1", Some(IDENTITY_TTL)).await {
            tracing::warn!("Resolver: failed to cache existence of {}: {}", device_id, e);
        }
        Ok(())
    }

    /// Resolve an agent-supplied device reference: a numeric id or an address.
    pub async fn resolve_reference(&self, reference: &str) -> Result<i64> {
        let reference = reference.trim();
        match reference.parse::<i64>() {
            Ok(id) => {
                self.confirm_device(id).await?;
                Ok(id)
            }
            Err(_) => Ok(self.resolve_by_address(reference).await?.id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{Device, DeviceStore, MemoryCache};
    use tokio_test::assert_ok;

    fn setup() -> (DeviceStore, Arc<MemoryCache>, DeviceResolver) {
        let store = DeviceStore::in_memory().unwrap();
        let cache = Arc::new(MemoryCache::new());
        let resolver = DeviceResolver::new(Arc::new(store.clone()), cache.clone());
        (store, cache, resolver)
    }

    #[tokio::test]
    async fn test_resolve_populates_cache() {
        let (store, cache, resolver) = setup();
        let mut dev = Device {
            name: "core-1".into(),
            host: "10.0.0.1".into(),
            ..Default::default()
        };
        let id = store.add_device(&mut dev).unwrap();

        let identity = resolver.resolve_by_address("10.0.0.1").await.unwrap();
        assert_eq!(identity.id, id);
        assert!(cache.exists(&keys::ip("10.0.0.1")).await.unwrap());
        let ttl = cache.ttl(&keys::ip("10.0.0.1")).unwrap();
        assert!(ttl > Duration::from_secs(3500) && ttl <= IDENTITY_TTL);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_repository() {
        let (_store, cache, resolver) = setup();
        let cached = DeviceIdentity {
            id: 42,
            name: "cached".into(),
            host: "10.0.0.9".into(),
        };
        let cache_dyn: Arc<dyn CacheClient> = cache.clone();
        cache_dyn
            .set_json(&keys::ip("10.0.0.9"), &cached, None)
            .await
            .unwrap();

        assert_eq!(resolver.resolve_by_address("10.0.0.9").await.unwrap(), cached);
    }

    #[tokio::test]
    async fn test_unknown_address_is_not_found() {
        let (_store, _cache, resolver) = setup();
        let err = resolver.resolve_by_address("192.0.2.1").await.unwrap_err();
        assert!(err.is_not_found());
        let err = resolver.resolve_by_address("  ").await.unwrap_err();
        assert!(err.is_validation());
    }

    #[tokio::test]
    async fn test_resolve_reference() {
        let (store, cache, resolver) = setup();
        let mut dev = Device {
            name: "core-1".into(),
            host: "10.0.0.1".into(),
            ..Default::default()
        };
        let id = store.add_device(&mut dev).unwrap();

        assert_eq!(resolver.resolve_reference(&id.to_string()).await.unwrap(), id);
        assert!(cache.exists(&keys::exists(id)).await.unwrap());
        assert_eq!(resolver.resolve_reference("10.0.0.1").await.unwrap(), id);
        assert!(resolver.resolve_reference("999").await.unwrap_err().is_not_found());
        assert!(resolver.resolve_reference("0").await.unwrap_err().is_validation());
        assert_ok!(resolver.confirm_device(id).await);
    }
}
