//! Device family capability set: how the hub obtains this family's central.

use std::sync::Arc;

use crate::central::Central;
use crate::protocol::{StructBuilder, Value, FAMILY_ID, FAMILY_NAME};
use crate::Context;

/// Default central of the family.
pub const CENTRAL_ID: u64 = 0;
pub const CENTRAL_SERIAL: &str = "VIC0000001";

/// What the hub needs from a device family.
pub trait DeviceFamily {
    fn id(&self) -> i32;
    fn name(&self) -> &str;
    /// The family's default central.
    fn create_central(&self, ctx: Arc<Context>) -> Arc<Central>;
    /// A central restored from a persisted device row.
    fn initialize_central(&self, ctx: Arc<Context>, device_id: u64, serial: &str) -> Arc<Central>;
    /// Pairing methods and interfaces shown by hub front ends.
    fn pairing_info(&self) -> Value;
}

#[derive(Debug, Default)]
pub struct IpCamFamily;

impl DeviceFamily for IpCamFamily {
    fn id(&self) -> i32 {
        FAMILY_ID
    }

    fn name(&self) -> &str {
        FAMILY_NAME
    }

    fn create_central(&self, ctx: Arc<Context>) -> Arc<Central> {
        let central = Arc::new(Central::new(ctx, CENTRAL_ID, CENTRAL_SERIAL));
        tracing::info!(central_id = central.id(), "Created IpCam central");
        central
    }

    fn initialize_central(&self, ctx: Arc<Context>, device_id: u64, serial: &str) -> Arc<Central> {
        Arc::new(Central::new(ctx, device_id, serial))
    }

    fn pairing_info(&self) -> Value {
        let create_device = StructBuilder::new()
            .field(
                "metadataInfo",
                StructBuilder::new()
                    .field(
                        "fields",
                        vec![Value::from("deviceType"), Value::from("serialNumber")],
                    )
                    .build(),
            )
            .build();
        let event_server = StructBuilder::new()
            .field("name", "Event Server")
            .field("ipDevice", false)
            .field("predefined", true)
            .field(
                "id",
                StructBuilder::new()
                    .field("pos", 0i64)
                    .field("label", "l10n.common.id")
                    .field("type", "string")
                    .build(),
            )
            .field(
                "host",
                StructBuilder::new()
                    .field("pos", 2i64)
                    .field("label", "l10n.common.listenip")
                    .field("type", "string")
                    .field("required", false)
                    .build(),
            )
            .build();
        StructBuilder::new()
            .field("searchInterfaces", false)
            .field(
                "pairingMethods",
                StructBuilder::new().field("createDevice", create_device).build(),
            )
            .field(
                "interfaces",
                StructBuilder::new().field("eventserver", event_server).build(),
            )
            .build()
    }
}
