//! Interface MTU adjustments requested by the launch settings.

use std::collections::BTreeMap;
use tokio::process::Command;
use tracing::{info, warn};

/// Set each interface's MTU with `ip link`. Failures are logged and
/// otherwise ignored.
pub async fn apply_mtu(mtu: &BTreeMap<String, u32>) {
    for (interface, value) in mtu {
        let mtu_value = value.to_string();
        let result = Command::new("ip")
            .args(["link", "set", "dev", interface.as_str(), "mtu", mtu_value.as_str()])
            .output()
            .await;

        match result {
            Ok(output) if output.status.success() => {
                info!(interface = %interface, mtu = value, "Interface MTU set");
            }
            Ok(output) => warn!(
                interface = %interface,
                mtu = value,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Could not set interface MTU"
            ),
            Err(e) => warn!(interface = %interface, error = %e, "Could not run ip"),
        }
    }
}
