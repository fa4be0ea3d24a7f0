use greenbox_kernel::models::PhAlert;
use greenbox_kernel::threshold::Threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhState {
    Low,
    Ok,
    High,
}

/// Alerts on transitions into `Low` or `High`; raw bounds, no deadband.
#[derive(Debug, Clone)]
pub struct PhMonitor {
    lower: f64,
    upper: f64,
    state: Option<PhState>,
}

impl PhMonitor {
    pub fn new(threshold: &Threshold) -> Self {
        Self {
            lower: threshold.lower,
            upper: threshold.upper,
            state: None,
        }
    }

    pub fn state(&self) -> Option<PhState> {
        self.state
    }

    pub fn observe(&mut self, value: f64) -> Option<PhAlert> {
        let state = if value < self.lower {
            PhState::Low
        } else if value > self.upper {
            PhState::High
        } else {
            PhState::Ok
        };
        if self.state == Some(state) {
            return None;
        }
        self.state = Some(state);
        match state {
            PhState::Low => Some(PhAlert::new(format!("pH too low ({value:.2} < {})", self.lower))),
            PhState::High => Some(PhAlert::new(format!("pH too high ({value:.2} > {})", self.upper))),
            PhState::Ok => None,
        }
    }
}
