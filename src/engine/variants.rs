use serde::Serialize;
use ts_rs::TS;

use super::reconnect::Affordance;
use crate::core::{GatewayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, TS)]
#[ts(export)]
pub enum PickerState {
    /// Variant list not loaded yet
    Pending,
    /// The console permits no shell variant at all
    Invalid,
    /// A variant is selected, nothing started yet
    Ready,
    /// A session was started from this picker
    Working,
}

/// Shell variant selector of one console tab
#[derive(Debug, Clone)]
pub struct VariantPicker {
    state: PickerState,
    variants: Vec<String>,
    selected: Option<String>,
}

impl Default for VariantPicker {
    fn default() -> Self {
        Self::new()
    }
}

impl VariantPicker {
    pub fn new() -> Self {
        VariantPicker {
            state: PickerState::Pending,
            variants: Vec::new(),
            selected: None,
        }
    }

    pub fn state(&self) -> PickerState {
        self.state
    }

    pub fn variants(&self) -> &[String] {
        &self.variants
    }

    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// Install the discovered variant list. The first entry is preselected
    /// unless the current selection is still offered.
    pub fn load(&mut self, variants: Vec<String>) {
        let keep = self
            .selected
            .as_ref()
            .filter(|current| variants.contains(current))
            .cloned();
        self.selected = keep.or_else(|| variants.first().cloned());
        self.variants = variants;

        self.state = match (self.state, self.selected.is_some()) {
            (_, false) => PickerState::Invalid,
            (PickerState::Working, true) => PickerState::Working,
            (_, true) => PickerState::Ready,
        };
    }

    pub fn select(&mut self, cmd: &str) -> Result<()> {
        if !self.variants.iter().any(|v| v == cmd) {
            return Err(GatewayError::ShellNotAllowed {
                cmd: cmd.to_string(),
            });
        }
        self.selected = Some(cmd.to_string());
        Ok(())
    }

    /// The button to show, or `None` while it must stay disabled
    pub fn affordance(&self) -> Option<Affordance> {
        match self.state {
            PickerState::Pending | PickerState::Invalid => None,
            PickerState::Ready => Some(Affordance::Connect),
            PickerState::Working => Some(Affordance::Reconnect),
        }
    }

    /// Take the selected variant for a new session and move to Working
    pub fn start(&mut self) -> Option<String> {
        if self.affordance().is_none() {
            return None;
        }
        let cmd = self.selected.clone()?;
        self.state = PickerState::Working;
        Some(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_picker_lifecycle() {
        let mut picker = VariantPicker::new();
        assert_eq!(picker.state(), PickerState::Pending);
        assert_eq!(picker.affordance(), None);
        assert_eq!(picker.start(), None);

        picker.load(vec!["bash".into(), "zsh".into()]);
        assert_eq!(picker.state(), PickerState::Ready);
        assert_eq!(picker.selected(), Some("bash"));
        assert_eq!(picker.affordance(), Some(Affordance::Connect));

        picker.select("zsh").unwrap();
        assert!(picker.select("fish").is_err());
        assert_eq!(picker.start().as_deref(), Some("zsh"));
        assert_eq!(picker.state(), PickerState::Working);
        assert_eq!(picker.affordance(), Some(Affordance::Reconnect));

        // a refresh keeps the tab in Working and the selection if still offered
        picker.load(vec!["sh".into(), "zsh".into()]);
        assert_eq!(picker.state(), PickerState::Working);
        assert_eq!(picker.selected(), Some("zsh"));
    }

    #[test]
    fn test_empty_list_is_invalid() {
        let mut picker = VariantPicker::new();
        picker.load(Vec::new());
        assert_eq!(picker.state(), PickerState::Invalid);
        assert_eq!(picker.affordance(), None);
        assert_eq!(picker.start(), None);
    }
}
