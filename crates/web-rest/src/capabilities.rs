//! # Capabilities
//!
//! The seven management APIs the Web/REST service consumes. Each one is a marker
//! type implementing [`Capability`] plus an `XxxApiDemux` alias for the demux that
//! routes calls to it:
//!
//! | Capability | Marker | Demux alias |
//! |------------|--------|-------------|
//! | `user-management` | [`UserManagement`] | [`UserManagementApiDemux`] |
//! | `tenant-management` | [`TenantManagement`] | [`TenantManagementApiDemux`] |
//! | `device-management` | [`DeviceManagement`] | [`DeviceManagementApiDemux`] |
//! | `device-event-management` | [`DeviceEventManagement`] | [`DeviceEventManagementApiDemux`] |
//! | `asset-management` | [`AssetManagement`] | [`AssetManagementApiDemux`] |
//! | `batch-management` | [`BatchManagement`] | [`BatchManagementApiDemux`] |
//! | `schedule-management` | [`ScheduleManagement`] | [`ScheduleManagementApiDemux`] |

use crate::model::*;
use microservice_framework::{ApiDemux, Capability};

macro_rules! capabilities {
    ($( $(#[$meta:meta])* $name:ident => $key:literal, $req:ty, $resp:ty; )*) => {
        paste::paste! {
            $(
                $(#[$meta])*
                #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
                pub struct $name;

                impl Capability for $name {
                    const NAME: &'static str = $key;
                    type Request = $req;
                    type Response = $resp;
                }

                #[doc = "Routes calls to the `" $key "` capability."]
                pub type [<$name ApiDemux>] = ApiDemux<$name>;
            )*

            /// Names of every capability the service depends on, in boot order.
            pub const ALL: &[&str] = &[$($key),*];
        }
    };
}

capabilities! {
    /// User accounts.
    UserManagement => "user-management", UserRequest, UserResponse;
    /// Tenants; global only.
    TenantManagement => "tenant-management", TenantRequest, TenantResponse;
    /// Device registry, scoped per tenant.
    DeviceManagement => "device-management", DeviceRequest, DeviceResponse;
    /// Event persistence, scoped per tenant.
    DeviceEventManagement => "device-event-management", DeviceEventRequest, DeviceEventResponse;
    /// Asset registry, scoped per tenant.
    AssetManagement => "asset-management", AssetRequest, AssetResponse;
    /// Batch command fan-out, scoped per tenant.
    BatchManagement => "batch-management", BatchRequest, BatchResponse;
    /// Recurring schedules, scoped per tenant.
    ScheduleManagement => "schedule-management", ScheduleRequest, ScheduleResponse;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_names_are_unique() {
        let mut names = ALL.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 7);
        assert_eq!(ALL[0], UserManagement::NAME);
        assert_eq!(ALL[6], ScheduleManagement::NAME);
    }
}
