//! PulseAudio-Compatible Sink and Card Queries (`pactl`)
//!
//! Works against PulseAudio proper and against `pipewire-pulse`, which is
//! why the PipeWire driver falls back to it and why card profiles are
//! switched through it.

use tracing::debug;

use super::command::CommandRunner;
use crate::device::{Device, Driver};
use crate::error::PlatformResult;

/// List sinks as devices of `driver`, skipping monitor sources
pub fn list_sinks(runner: &dyn CommandRunner, driver: Driver) -> PlatformResult<Vec<Device>> {
    let text = runner.run("pactl", &["list", "sinks"])?;
    let devices = parse_sinks(&text, driver);
    debug!("pactl reported {} sinks", devices.len());
    Ok(devices)
}

/// Parse `pactl list sinks`
///
/// ```text
/// Sink #52
///     State: SUSPENDED
///     Name: alsa_output.usb-Topping_DAC-00.analog-stereo
///     Description: Topping DAC Analog Stereo
/// ```
///
/// The description becomes the name, falling back to the sink name.
pub fn parse_sinks(text: &str, driver: Driver) -> Vec<Device> {
    let mut out = Vec::new();
    for block in text.split("Sink #") {
        let mut sink_name: Option<&str> = None;
        let mut description: Option<&str> = None;
        for raw in block.lines() {
            let line = raw.trim();
            if let Some(rest) = line.strip_prefix("Name:") {
                let n = rest.trim();
                if !n.is_empty() {
                    sink_name = Some(n);
                }
            } else if let Some(rest) = line.strip_prefix("Description:") {
                let d = rest.trim();
                if !d.is_empty() {
                    description = Some(d);
                }
            }
        }
        let Some(id) = sink_name else {
            continue;
        };
        if id.ends_with(".monitor") {
            continue;
        }
        out.push(Device::new(
            driver,
            description.unwrap_or(id),
            Some(id.to_string()),
        ));
    }
    out
}

/// Active profile of `card` from `pactl list cards`
pub fn card_active_profile(runner: &dyn CommandRunner, card: &str) -> Option<String> {
    let text = runner.run("pactl", &["list", "cards"]).ok()?;
    parse_active_profile(&text, card)
}

pub fn parse_active_profile(text: &str, card: &str) -> Option<String> {
    let mut current = "";
    for raw in text.lines() {
        let line = raw.trim();
        if let Some(rest) = line.strip_prefix("Name:") {
            current = rest.trim();
            continue;
        }
        if current == card {
            if let Some(rest) = line.strip_prefix("Active Profile:") {
                return Some(rest.trim().to_string());
            }
        }
    }
    None
}

pub fn set_card_profile(runner: &dyn CommandRunner, card: &str, profile: &str) -> PlatformResult<()> {
    runner.run("pactl", &["set-card-profile", card, profile])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SINKS: &str = "Sink #52
\tState: SUSPENDED
\tName: alsa_output.pci-0000_00_1f.3.analog-stereo
\tDescription: Built-in Audio Analog Stereo
\tDriver: PipeWire
\tSample Specification: s32le 2ch 48000Hz

Sink #61
\tState: RUNNING
\tName: alsa_output.usb-Topping_DAC-00.analog-stereo
\tDescription: Topping DAC
\tSample Specification: s24le 2ch 96000Hz

Sink #70
\tName: alsa_output.usb-Topping_DAC-00.analog-stereo.monitor
\tDescription: Monitor of Topping DAC

Sink #71
\tName: bluez_output.00_11_22
";

    #[test]
    fn test_parse_sinks() {
        let sinks = parse_sinks(SINKS, Driver::PulseAudio);
        assert_eq!(sinks.len(), 3);
        assert_eq!(sinks[0].name, "Built-in Audio Analog Stereo");
        assert_eq!(sinks[1].name, "Topping DAC");
        assert_eq!(
            sinks[1].id.as_deref(),
            Some("alsa_output.usb-Topping_DAC-00.analog-stereo")
        );
        // No description: name falls back to the sink name
        assert_eq!(sinks[2].name, "bluez_output.00_11_22");
        assert!(sinks.iter().all(|d| !d.name.starts_with("Monitor of")));
    }

    #[test]
    fn test_parse_active_profile() {
        let text = "Card #40
\tName: alsa_card.pci-0000_00_1f.3
\tActive Profile: output:analog-stereo
Card #41
\tName: alsa_card.usb-Topping_DAC-00
\tProfiles:
\t\tpro-audio: Pro Audio
\tActive Profile: pro-audio
";
        assert_eq!(
            parse_active_profile(text, "alsa_card.usb-Topping_DAC-00").as_deref(),
            Some("pro-audio")
        );
        assert_eq!(
            parse_active_profile(text, "alsa_card.pci-0000_00_1f.3").as_deref(),
            Some("output:analog-stereo")
        );
        assert_eq!(parse_active_profile(text, "alsa_card.missing"), None);
    }
}
