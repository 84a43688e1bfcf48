//! Command-line surface and validated runtime configuration.

use anyhow::{Context, Result};
use clap::Parser;

use crate::combo::{self, EscapeCombo};
use crate::scheduler::DEFAULT_MAX_DELAY_MS;

/// Default pre-init sleep in milliseconds.
pub const DEFAULT_STARTUP_DELAY_MS: i32 = 500;

/// Default overlay cursor color (opaque red, AARRGGBB).
pub const DEFAULT_CURSOR_COLOR: u32 = 0xFFFF_0000;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "wayveil")]
#[command(version, about = "Anonymizes keyboard and mouse input patterns by injecting jitter \
into input events. Designed for wlroots-based Wayland compositors; will NOT work with X11.")]
pub struct Args {
    /// Maximum additional delay of released events, in milliseconds
    #[arg(
        short = 'd',
        long = "delay",
        value_name = "MS",
        default_value_t = DEFAULT_MAX_DELAY_MS as i32,
        value_parser = clap::value_parser!(i32).range(0..)
    )]
    pub delay: i32,

    /// Time to wait before startup, in milliseconds
    #[arg(
        short = 's',
        long = "start-delay",
        value_name = "MS",
        default_value_t = DEFAULT_STARTUP_DELAY_MS,
        value_parser = clap::value_parser!(i32).range(0..)
    )]
    pub start_delay: i32,

    /// Overlay cursor color as AARRGGBB hex
    #[arg(
        short = 'c',
        long = "color",
        value_name = "AARRGGBB",
        default_value = "FFFF0000",
        value_parser = parse_color
    )]
    pub color: u32,

    /// Escape key combo: slots joined with ',', aliases within a slot with '|'
    #[arg(
        short = 'k',
        long = "esc-key-combo",
        value_name = "COMBO",
        default_value = combo::DEFAULT_COMBO
    )]
    pub esc_key_combo: String,

    /// Verbose logging (repeat for more detail)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum per-event delay in milliseconds.
    pub max_delay: i64,
    /// Pre-init sleep in milliseconds.
    pub startup_delay: u64,
    /// Overlay cursor color, ARGB8888.
    pub cursor_color: u32,
    /// Parsed escape combo.
    pub combo: EscapeCombo,
}

impl Config {
    /// Validates the parsed arguments into a runtime configuration.
    pub fn from_args(args: &Args) -> Result<Self> {
        let combo = EscapeCombo::parse(&args.esc_key_combo)
            .context("invalid escape key combo")?;
        Ok(Self {
            max_delay: i64::from(args.delay),
            startup_delay: args.start_delay as u64,
            cursor_color: args.color,
            combo,
        })
    }
}

/// Parses an AARRGGBB color value.
fn parse_color(value: &str) -> Result<u32, String> {
    if value.len() != 8 || !value.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(format!(
            "'{value}' is not an 8-digit AARRGGBB hex color"
        ));
    }
    u32::from_str_radix(value, 16).map_err(|err| err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["wayveil"]);
        assert_eq!(args.delay, 100);
        assert_eq!(args.start_delay, 500);
        assert_eq!(args.color, DEFAULT_CURSOR_COLOR);
        assert_eq!(args.esc_key_combo, combo::DEFAULT_COMBO);

        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.max_delay, 100);
        assert_eq!(config.startup_delay, 500);
        assert_eq!(config.combo.slot_count(), 3);
    }

    #[test]
    fn test_parse_color_values() {
        assert_eq!(parse_color("FFFF0000").unwrap(), 0xFFFF_0000);
        assert_eq!(parse_color("80123456").unwrap(), 0x8012_3456);
        assert!(parse_color("FF0000").is_err());
        assert!(parse_color("GGGG0000").is_err());
        assert!(parse_color("0xFF0000A").is_err());
    }

    #[test]
    fn test_negative_delay_rejected() {
        assert!(Args::try_parse_from(["wayveil", "--delay", "-1"]).is_err());
        assert!(Args::try_parse_from(["wayveil", "-s", "-5"]).is_err());
    }

    #[test]
    fn test_delay_accepts_full_range() {
        let args = Args::try_parse_from(["wayveil", "-d", "2147483647"]).unwrap();
        assert_eq!(args.delay, i32::MAX);
    }

    #[test]
    fn test_custom_combo_flows_through() {
        let args =
            Args::try_parse_from(["wayveil", "-k", "KEY_LEFTCTRL|KEY_RIGHTCTRL,KEY_F12"]).unwrap();
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.combo.slot_count(), 2);
    }

    #[test]
    fn test_bad_combo_is_rejected() {
        let args = Args::try_parse_from(["wayveil", "-k", "KEY_NOPE"]).unwrap();
        assert!(Config::from_args(&args).is_err());
    }

    #[test]
    fn test_unknown_option_fails_parse() {
        assert!(Args::try_parse_from(["wayveil", "--frobnicate"]).is_err());
    }
}
