//! PipeWire output node -> ALSA card mapping

/// Profile suffixes PipeWire appends to ALSA output node names
const OUTPUT_SUFFIXES: [&str; 7] = [
    ".analog-stereo",
    ".pro-output-0",
    ".pro-output-1",
    ".pro-output-2",
    ".pro-output-3",
    ".multichannel-output",
    ".iec958-stereo",
];

/// `alsa_output.usb-X.analog-stereo` -> `alsa_card.usb-X`
///
/// Returns `None` for anything that is not an ALSA output node.
pub fn card_from_pipewire_output_node(device_id: &str) -> Option<String> {
    let core = device_id.trim().strip_prefix("alsa_output.")?;
    let core = OUTPUT_SUFFIXES
        .iter()
        .find_map(|sx| core.strip_suffix(sx))
        .unwrap_or(core);
    if core.is_empty() {
        return None;
    }
    Some(format!("alsa_card.{}", core))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_from_node() {
        assert_eq!(
            card_from_pipewire_output_node("alsa_output.usb-Topping_DAC-00.analog-stereo").as_deref(),
            Some("alsa_card.usb-Topping_DAC-00")
        );
        assert_eq!(
            card_from_pipewire_output_node("alsa_output.usb-Topping_DAC-00.pro-output-0").as_deref(),
            Some("alsa_card.usb-Topping_DAC-00")
        );
        assert_eq!(
            card_from_pipewire_output_node("alsa_output.pci-0000_00_1f.3.iec958-stereo").as_deref(),
            Some("alsa_card.pci-0000_00_1f.3")
        );
        // Unknown suffix is kept as-is
        assert_eq!(
            card_from_pipewire_output_node("alsa_output.usb-X.surround-51").as_deref(),
            Some("alsa_card.usb-X.surround-51")
        );
    }

    #[test]
    fn test_card_from_node_rejects() {
        assert_eq!(card_from_pipewire_output_node("hw:1,0"), None);
        assert_eq!(card_from_pipewire_output_node("bluez_output.00_11"), None);
        assert_eq!(card_from_pipewire_output_node("alsa_output..analog-stereo"), None);
        assert_eq!(card_from_pipewire_output_node(""), None);
    }
}
