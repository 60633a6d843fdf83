//! Request kinds a device knows how to answer

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Kind of data or action requested from a device
///
/// The kind names the request and response slots in the store
/// (`requests/{device}/{kind}`, `responses/{device}/{kind}`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Sms,
    Calls,
    Gallery,
    InstalledApps,
    SimInfo,
    InstallApk,
    Cmd,
    Snapshot,
    HotspotStatus,
    SendSms,
}

impl RequestKind {
    /// Every kind, in declaration order
    pub const ALL: [Self; 10] = [
        Self::Sms,
        Self::Calls,
        Self::Gallery,
        Self::InstalledApps,
        Self::SimInfo,
        Self::InstallApk,
        Self::Cmd,
        Self::Snapshot,
        Self::HotspotStatus,
        Self::SendSms,
    ];

    /// Store/wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sms => "sms",
            Self::Calls => "calls",
            Self::Gallery => "gallery",
            Self::InstalledApps => "installedApps",
            Self::SimInfo => "simInfo",
            Self::InstallApk => "installApk",
            Self::Cmd => "cmd",
            Self::Snapshot => "snapshot",
            Self::HotspotStatus => "hotspotStatus",
            Self::SendSms => "sendSms",
        }
    }

    /// Default wait window
    ///
    /// Small metadata fetches get 15s, media and shell work a little more,
    /// and package installs a full minute since the device downloads first.
    #[must_use]
    pub const fn default_timeout(self) -> Duration {
        match self {
            Self::Sms | Self::Calls | Self::SimInfo | Self::InstalledApps | Self::HotspotStatus
            | Self::SendSms => Duration::from_secs(15),
            Self::Gallery | Self::Snapshot => Duration::from_secs(20),
            Self::Cmd => Duration::from_secs(25),
            Self::InstallApk => Duration::from_secs(60),
        }
    }

    /// Response member carrying the result payload
    #[must_use]
    pub const fn result_field(self) -> &'static str {
        match self {
            Self::Sms => "smsList",
            Self::Calls => "callList",
            Self::Gallery => "images",
            Self::InstalledApps => "apps",
            Self::SimInfo => "simList",
            Self::InstallApk | Self::SendSms => "result",
            Self::Cmd => "output",
            Self::Snapshot => "image",
            Self::HotspotStatus => "status",
        }
    }

    /// Whether the result is a list (an empty list stands in for "no data")
    #[must_use]
    pub const fn is_listing(self) -> bool {
        matches!(
            self,
            Self::Sms | Self::Calls | Self::Gallery | Self::InstalledApps | Self::SimInfo
        )
    }

    /// Whether a timeout means "still running on the device" rather than failure
    #[must_use]
    pub const fn outlives_wait(self) -> bool {
        matches!(self, Self::InstallApk)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown request kind '{s}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_from_str() {
        for kind in RequestKind::ALL {
            assert_eq!(kind.as_str().parse::<RequestKind>().unwrap(), kind);
            assert_eq!(
                serde_json::to_value(kind).unwrap(),
                serde_json::Value::from(kind.as_str())
            );
        }
        assert!("whatever".parse::<RequestKind>().is_err());
    }

    #[test]
    fn install_gets_the_longest_window() {
        let longest = RequestKind::ALL
            .into_iter()
            .max_by_key(|k| k.default_timeout())
            .unwrap();
        assert_eq!(longest, RequestKind::InstallApk);
        assert!(longest.outlives_wait());
        assert!(!RequestKind::Sms.outlives_wait());
    }
}
