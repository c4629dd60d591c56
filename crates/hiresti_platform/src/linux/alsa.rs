//! ALSA Card Listing and Kernel Runtime Format Reader
//!
//! Both read procfs directly, so they work even when no session manager is
//! running. The kernel reader is the fallback source of truth for what the
//! DAC is actually clocked at:
//!
//! ```text
//! /proc/asound/card1/pcm0p/sub0/status     state: RUNNING
//! /proc/asound/card1/pcm0p/sub0/hw_params  format: S24_3LE
//!                                          rate: 96000 (96000/1)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::device::{depth_from_format_name, Device, Driver, FormatSource, RuntimeFormat};
use crate::error::{PlatformError, PlatformResult};

/// Default procfs root for ALSA
pub const PROC_ASOUND: &str = "/proc/asound";

/// Reader rooted at a procfs directory (overridable for tests)
#[derive(Debug, Clone)]
pub struct AlsaProc {
    root: PathBuf,
}

impl Default for AlsaProc {
    fn default() -> Self {
        Self::new(PROC_ASOUND)
    }
}

impl AlsaProc {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn is_present(&self) -> bool {
        self.root.join("cards").exists()
    }

    /// List playback cards as `"{long name} (Card N)"` with id `hw:N,0`
    pub fn list_cards(&self) -> PlatformResult<Vec<Device>> {
        let path = self.root.join("cards");
        let content = fs::read_to_string(&path).map_err(|source| PlatformError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(parse_cards(&content))
    }

    /// Format of the first RUNNING playback substream
    ///
    /// When `device_id` is an `hw:N,M` address only that card/pcm is scanned.
    pub fn running_format(&self, device_id: Option<&str>) -> Option<RuntimeFormat> {
        let filter = device_id.and_then(parse_hw_address);
        let cards = fs::read_dir(&self.root).ok()?;

        for card in cards.flatten() {
            let card_name = card.file_name().to_string_lossy().to_string();
            let Some(card_idx) = card_name.strip_prefix("card") else {
                continue;
            };
            if let Some((want_card, _)) = filter {
                if card_idx != want_card.to_string() {
                    continue;
                }
            }
            let Ok(pcms) = fs::read_dir(card.path()) else {
                continue;
            };
            for pcm in pcms.flatten() {
                let pcm_name = pcm.file_name().to_string_lossy().to_string();
                if !(pcm_name.starts_with("pcm") && pcm_name.ends_with('p')) {
                    continue;
                }
                if let Some((_, want_pcm)) = filter {
                    if pcm_name != format!("pcm{}p", want_pcm) {
                        continue;
                    }
                }
                if let Some(format) = Self::scan_substreams(&pcm.path()) {
                    debug!(
                        "Kernel runtime format {}/{}: {} Hz / {} bit",
                        card_name, pcm_name, format.rate, format.depth
                    );
                    return Some(format);
                }
            }
        }
        None
    }

    fn scan_substreams(pcm_path: &Path) -> Option<RuntimeFormat> {
        let subs = fs::read_dir(pcm_path).ok()?;
        for sub in subs.flatten() {
            if !sub.file_name().to_string_lossy().starts_with("sub") {
                continue;
            }
            let Ok(status) = fs::read_to_string(sub.path().join("status")) else {
                continue;
            };
            if !status.to_ascii_uppercase().contains("RUNNING") {
                continue;
            }
            let Ok(hw_params) = fs::read_to_string(sub.path().join("hw_params")) else {
                continue;
            };
            let (rate, depth) = parse_hw_params(&hw_params);
            if let (Some(rate), Some(depth)) = (rate, depth) {
                return Some(RuntimeFormat {
                    rate,
                    depth,
                    source: FormatSource::Kernel,
                });
            }
        }
        None
    }
}

/// Parse `/proc/asound/cards`
///
/// ```text
///  0 [PCH            ]: HDA-Intel - HDA Intel PCH
///                       HDA Intel PCH at 0xf7f10000 irq 32
///  1 [DAC            ]: USB-Audio - USB DAC
/// ```
///
/// USB cards sort first; the relative order of the rest is kept.
pub fn parse_cards(content: &str) -> Vec<Device> {
    let mut out = Vec::new();
    for raw in content.lines() {
        let line = raw.trim_start();
        let Some(first) = line.split_whitespace().next() else {
            continue;
        };
        if !first.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let Some(dash) = line.rfind(" - ") else {
            continue;
        };
        let long_name = line[dash + 3..].trim();
        if long_name.is_empty() {
            continue;
        }
        out.push(Device::new(
            Driver::Alsa,
            format!("{} (Card {})", long_name, first),
            Some(format!("hw:{},0", first)),
        ));
    }
    // Stable sort keeps backend order within each group
    out.sort_by_key(|d| if d.name.contains("USB") { 0 } else { 1 });
    out
}

/// Parse `rate:` and `format:` lines from a `hw_params` file
pub fn parse_hw_params(text: &str) -> (Option<u32>, Option<u16>) {
    let mut rate = None;
    let mut depth = None;
    for line in text.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("format:") {
            if let Some(d) = depth_from_format_name(rest) {
                depth = Some(d);
            }
        } else if let Some(rest) = line.strip_prefix("rate:") {
            let token = rest.split_whitespace().next().unwrap_or("");
            if let Ok(r) = token.parse::<u32>() {
                if r > 0 {
                    rate = Some(r);
                }
            }
        }
    }
    (rate, depth)
}

/// `hw:1,0` / `plughw:1,0` -> `(1, 0)`
pub fn parse_hw_address(id: &str) -> Option<(u32, u32)> {
    let (_, rest) = id.trim().split_once("hw:")?;
    let (card, dev) = rest.split_once(',').unwrap_or((rest, "0"));
    Some((card.trim().parse().ok()?, dev.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CARDS: &str = " 0 [PCH            ]: HDA-Intel - HDA Intel PCH
                      HDA Intel PCH at 0xf7f10000 irq 32
 1 [HDMI           ]: HDA-Intel - HDA Intel HDMI
                      HDA Intel HDMI at 0xf7f14000 irq 33
 2 [DAC            ]: USB-Audio - USB DAC
                      Topping USB DAC at usb-0000:00:14.0-2, high speed
";

    #[test]
    fn test_parse_cards_usb_first() {
        let cards = parse_cards(CARDS);
        assert_eq!(cards.len(), 3);
        assert_eq!(cards[0].name, "USB DAC (Card 2)");
        assert_eq!(cards[0].id.as_deref(), Some("hw:2,0"));
        assert_eq!(cards[1].name, "HDA Intel PCH (Card 0)");
        assert_eq!(cards[2].name, "HDA Intel HDMI (Card 1)");
        assert!(cards.iter().all(|d| d.driver == Driver::Alsa));
    }

    #[test]
    fn test_parse_cards_empty() {
        assert!(parse_cards("--- no soundcards ---").is_empty());
    }

    #[test]
    fn test_parse_hw_params() {
        let text = "access: MMAP_INTERLEAVED\nformat: S24_3LE\nsubformat: STD\nchannels: 2\nrate: 96000 (96000/1)\nperiod_size: 4800\n";
        assert_eq!(parse_hw_params(text), (Some(96000), Some(24)));
        assert_eq!(parse_hw_params("closed"), (None, None));
    }

    #[test]
    fn test_parse_hw_address() {
        assert_eq!(parse_hw_address("hw:2,0"), Some((2, 0)));
        assert_eq!(parse_hw_address("plughw:1,3"), Some((1, 3)));
        assert_eq!(parse_hw_address("hw:4"), Some((4, 0)));
        assert_eq!(parse_hw_address("alsa_output.usb"), None);
    }

    fn write_substream(root: &Path, card: u32, status: &str, hw_params: &str) {
        let sub = root.join(format!("card{}", card)).join("pcm0p").join("sub0");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("status"), status).unwrap();
        fs::write(sub.join("hw_params"), hw_params).unwrap();
    }

    #[test]
    fn test_running_format_from_procfs() {
        let dir = tempfile::tempdir().unwrap();
        write_substream(dir.path(), 0, "closed\n", "closed\n");
        write_substream(
            dir.path(),
            1,
            "state: RUNNING\nowner_pid   : 4242\n",
            "format: S32_LE\nrate: 192000 (192000/1)\n",
        );

        let proc = AlsaProc::new(dir.path());
        let format = proc.running_format(None).expect("running substream");
        assert_eq!(format.rate, 192000);
        assert_eq!(format.depth, 32);
        assert_eq!(format.source, FormatSource::Kernel);

        assert!(proc.running_format(Some("hw:0,0")).is_none());
        assert!(proc.running_format(Some("hw:1,0")).is_some());
    }

    #[test]
    fn test_list_cards_missing_root() {
        let proc = AlsaProc::new("/nonexistent/asound");
        assert!(!proc.is_present());
        assert!(proc.list_cards().is_err());
    }
}
