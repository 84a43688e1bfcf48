//! Escape-combo watcher.
//!
//! Exclusive evdev grabs mean no other process can see the keyboard, so
//! the daemon itself must provide a guaranteed way out. The combo is a
//! sequence of slots, each holding one or more alias key codes; a slot is
//! active while at least one of its aliases is physically held, and the
//! daemon terminates the moment every slot is active at once.
//!
//! Slot syntax on the command line: `KEY_NAME[|KEY_NAME...]`, slots joined
//! with `,`. Aliases are a disjunction, slots a conjunction.

use std::str::FromStr;

use evdev::Key;
use thiserror::Error;

/// Default escape combo: both shifts plus Escape.
pub const DEFAULT_COMBO: &str = "KEY_LEFTSHIFT,KEY_RIGHTSHIFT,KEY_ESC";

/// Combo parsing error types.
#[derive(Error, Debug)]
pub enum ComboError {
    /// A slot had no key names.
    #[error("empty slot in escape key combo")]
    EmptySlot,

    /// A key name was not a recognized evdev key.
    #[error("unrecognized key name '{0}' in escape key combo")]
    UnknownKey(String),
}

#[derive(Debug, Clone)]
struct Slot {
    aliases: Vec<u16>,
    /// How many aliases are currently held; >0 means the slot is active.
    held: u32,
}

/// Live matcher for the configured escape combo.
#[derive(Debug, Clone)]
pub struct EscapeCombo {
    slots: Vec<Slot>,
}

impl EscapeCombo {
    /// Parses a combo specification.
    pub fn parse(spec: &str) -> Result<Self, ComboError> {
        let mut slots = Vec::new();
        for slot_spec in spec.split(',') {
            let mut aliases = Vec::new();
            for name in slot_spec.split('|') {
                let name = name.trim();
                if name.is_empty() {
                    return Err(ComboError::EmptySlot);
                }
                let key =
                    Key::from_str(name).map_err(|_| ComboError::UnknownKey(name.to_string()))?;
                aliases.push(key.code());
            }
            if aliases.is_empty() {
                return Err(ComboError::EmptySlot);
            }
            slots.push(Slot { aliases, held: 0 });
        }
        if slots.is_empty() {
            return Err(ComboError::EmptySlot);
        }
        Ok(Self { slots })
    }

    /// Feeds one key transition; returns `true` when the combo fired.
    ///
    /// Termination is only reported on a press, and only while every slot
    /// has at least one alias held.
    pub fn observe(&mut self, code: u32, pressed: bool) -> bool {
        for slot in &mut self.slots {
            if slot.aliases.iter().any(|&alias| u32::from(alias) == code) {
                if pressed {
                    slot.held = slot.held.saturating_add(1);
                } else {
                    slot.held = slot.held.saturating_sub(1);
                }
            }
        }
        pressed && self.slots.iter().all(|slot| slot.held > 0)
    }

    /// Number of configured slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}
