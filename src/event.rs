/*!
 # Received gateway events

 Commands picked up by the gateway from other transmitters (wall switches,
 remotes) are reported back so the light state stays in sync.
*/

use std::fmt;

/// A lighting command received by the gateway for a known device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Device was switched on
    On,
    /// Device was switched off
    Off,
    /// Device was dimmed to a percentage (0-100)
    Dim(u8),
}

impl GatewayEvent {
    /// Brightness (0-255) carried by the event, if any
    pub fn brightness(&self) -> Option<u8> {
        match *self {
            GatewayEvent::Dim(percent) => Some(percent_to_brightness(percent)),
            GatewayEvent::On | GatewayEvent::Off => None,
        }
    }
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEvent::On => write!(f, "On"),
            GatewayEvent::Off => write!(f, "Off"),
            GatewayEvent::Dim(percent) => write!(f, "Dim {}%", percent),
        }
    }
}

/// Converts a 0-255 brightness to the 0-100 dim level the gateway expects
pub fn brightness_to_percent(brightness: u8) -> u8 {
    (u16::from(brightness) * 100 / 255) as u8
}

/// Converts a 0-100 dim level back to a 0-255 brightness
pub fn percent_to_brightness(percent: u8) -> u8 {
    (u16::from(percent.min(100)) * 255 / 100) as u8
}
