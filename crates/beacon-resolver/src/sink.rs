//! Address-push interface

use beacon_core::AddressSet;

/// Receives every fresh address set a resolver produces.
///
/// Each call carries a full replacement set; the implementor turns it into
/// routing decisions.
pub trait AddressSink: Send + Sync + 'static {
    fn update_addresses(&self, addresses: AddressSet);
}

impl<F> AddressSink for F
where
    F: Fn(AddressSet) + Send + Sync + 'static,
{
    fn update_addresses(&self, addresses: AddressSet) {
        self(addresses)
    }
}
