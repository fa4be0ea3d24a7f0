use greenbox_kernel::effects::{Effect, EffectsTable, ILLUMINATION_SYSTEM};
use greenbox_kernel::models::{ActuatorCommand, CommandKind};
use greenbox_kernel::threshold::Threshold;
use std::collections::BTreeMap;

/// Lamp controller for one zone; emits only when the decision changes.
#[derive(Debug, Clone)]
pub struct LightOptimizer {
    lower: f64,
    levels: Vec<u8>,
    effect: BTreeMap<u8, f64>,
    last: Option<ActuatorCommand>,
}

impl LightOptimizer {
    /// `None` when the zone has no illumination levels to command.
    pub fn new(threshold: &Threshold, effects: &EffectsTable) -> Option<Self> {
        let rows = effects.rows(ILLUMINATION_SYSTEM)?;
        let effect: BTreeMap<u8, f64> = rows
            .iter()
            .map(|(level, row)| (*level, row.effect("light").map(|e: Effect| e.value()).unwrap_or(0.0)))
            .collect();
        let levels: Vec<u8> = effect.keys().copied().collect();
        if !levels.iter().any(|l| *l > 0) {
            return None;
        }
        Some(Self {
            lower: threshold.band().lo,
            levels,
            effect,
            last: None,
        })
    }

    pub fn last_level(&self) -> u8 {
        self.last.map(|c| c.level).unwrap_or(0)
    }

    pub fn decide(&mut self, median: f64) -> Option<ActuatorCommand> {
        let current = self.last_level();
        let ambient = median - self.effect.get(&current).copied().unwrap_or(0.0);

        let command = if ambient >= self.lower {
            ActuatorCommand {
                cmd: CommandKind::Off,
                level: 0,
            }
        } else {
            let max_level = self.levels.last().copied().unwrap_or(0);
            let target = self
                .levels
                .iter()
                .copied()
                .find(|l| *l > 0 && ambient + self.effect.get(l).copied().unwrap_or(0.0) >= self.lower)
                .unwrap_or(max_level);
            ActuatorCommand {
                cmd: CommandKind::On,
                level: target,
            }
        };

        if self.last == Some(command) {
            return None;
        }
        self.last = Some(command);
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbox_devkit::effects_table;

    fn lamp() -> LightOptimizer {
        let effects = effects_table(&[
            (ILLUMINATION_SYSTEM, 50, &[("light", 300.0)]),
            (ILLUMINATION_SYSTEM, 100, &[("light", 500.0)]),
        ])
        .unwrap();
        LightOptimizer::new(&Threshold::new(5000.0, 15000.0, 50.0), &effects).unwrap()
    }

    #[test]
    fn lights_up_at_dusk_then_stays_quiet() {
        let mut opt = lamp();
        assert_eq!(
            opt.decide(3000.0),
            Some(ActuatorCommand {
                cmd: CommandKind::On,
                level: 100
            })
        );
        // the lamp's own 500 lux is subtracted, ambient stays 3000
        assert_eq!(opt.decide(3500.0), None);
    }

    #[test]
    fn picks_minimal_sufficient_level() {
        let mut opt = lamp();
        let cmd = opt.decide(4800.0).unwrap();
        assert_eq!(cmd.level, 50);
        // 5100 includes the lamp's 300 lux: ambient is still 4800
        assert_eq!(opt.decide(5100.0), None);
    }

    #[test]
    fn turns_off_exactly_at_band_edge() {
        let mut opt = lamp();
        assert_eq!(opt.decide(3000.0).unwrap().level, 100);
        let off = opt.decide(5550.0).unwrap();
        assert_eq!(off.cmd, CommandKind::Off);
        assert_eq!(off.level, 0);
        assert_eq!(opt.decide(5050.0), None);
    }

    #[test]
    fn absent_without_illumination_levels() {
        let effects = effects_table(&[("ventilation_system", 100, &[("temperature", -0.01)])]).unwrap();
        assert!(LightOptimizer::new(&Threshold::new(5000.0, 15000.0, 50.0), &effects).is_none());
    }
}
