//! Main optimizer: picks one level per actuator system.
//!
//! Every combination of levels is scored by the lexicographic key
//! `(infeasible, time_to_band, energy_cost, water_cost)`; the first strictly
//! smaller key wins, so ties keep the earliest combination of the search.

use greenbox_kernel::effects::{EffectsTable, ILLUMINATION_SYSTEM};
use greenbox_kernel::models::{ActionMap, MetricValues};
use greenbox_kernel::threshold::{Band, ThresholdMap};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Weights {
    pub energy: f64,
    pub water: f64,
}

impl Default for Weights {
    fn default() -> Self {
        Self { energy: 1.0, water: 1.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionMode {
    Hold,
    Optimized,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub mode: DecisionMode,
    pub actions: ActionMap,
    pub post_metrics: BTreeMap<String, f64>,
    pub violation: f64,
    /// Seconds to bring every metric back in band; `None` when infeasible.
    pub time_to_band_s: Option<f64>,
}

/// Metrics steered by the main optimizer: rate-driven ones only.
pub fn is_controlled_metric(metric: &str) -> bool {
    !matches!(metric.to_lowercase().as_str(), "ph" | "light" | "light_natural")
}

pub fn is_controlled_system(system: &str) -> bool {
    system != ILLUMINATION_SYSTEM && !system.starts_with("light")
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MetricTarget {
    band: Band,
    center: f64,
}

#[derive(Debug, Clone, Copy)]
struct Score {
    infeasible: bool,
    time: f64,
    energy: f64,
    water: f64,
}

impl Score {
    fn worst() -> Self {
        Self {
            infeasible: true,
            time: f64::INFINITY,
            energy: f64::INFINITY,
            water: f64::INFINITY,
        }
    }

    fn cmp(&self, other: &Self) -> Ordering {
        self.infeasible
            .cmp(&other.infeasible)
            .then(self.time.total_cmp(&other.time))
            .then(self.energy.total_cmp(&other.energy))
            .then(self.water.total_cmp(&other.water))
    }
}

struct Projection {
    feasible: bool,
    time: f64,
    post: BTreeMap<String, f64>,
    violation: f64,
}

pub struct MainOptimizer {
    targets: BTreeMap<String, MetricTarget>,
    effects: EffectsTable,
    /// Controlled systems with their ascending levels.
    systems: Vec<(String, Vec<u8>)>,
    weights: Weights,
    horizon_cap_s: Option<f64>,
}

impl MainOptimizer {
    pub fn new(
        thresholds: &ThresholdMap,
        effects: &EffectsTable,
        weights: Weights,
        horizon_cap_s: Option<f64>,
    ) -> Self {
        let targets = thresholds
            .iter()
            .filter(|(metric, _)| is_controlled_metric(metric))
            .map(|(metric, t)| {
                (
                    metric.to_string(),
                    MetricTarget {
                        band: t.band(),
                        center: t.center(),
                    },
                )
            })
            .collect();
        let systems = effects
            .systems()
            .filter(|s| is_controlled_system(s))
            .map(|s| (s.to_string(), effects.levels(s)))
            .filter(|(_, levels)| !levels.is_empty())
            .collect();
        Self {
            targets,
            effects: effects.clone(),
            systems,
            weights,
            horizon_cap_s,
        }
    }

    pub fn systems(&self) -> impl Iterator<Item = &str> {
        self.systems.iter().map(|(s, _)| s.as_str())
    }

    pub fn decide(&self, medians: &MetricValues, current: &ActionMap) -> Decision {
        let state = self.current_state(medians);

        let all_in_band = self.targets.iter().all(|(metric, t)| t.band.contains(state[metric]));
        if all_in_band {
            return Decision {
                mode: DecisionMode::Hold,
                actions: current.clone(),
                post_metrics: state,
                violation: 0.0,
                time_to_band_s: Some(0.0),
            };
        }
        if self.systems.is_empty() {
            return Decision {
                mode: DecisionMode::Hold,
                actions: ActionMap::new(),
                violation: self.violation(&state),
                post_metrics: state,
                time_to_band_s: None,
            };
        }

        let mut best_score = Score::worst();
        let mut best_actions: ActionMap = self.systems.iter().map(|(s, _)| (s.clone(), 0)).collect();
        let mut best_projection = Projection {
            feasible: false,
            time: f64::INFINITY,
            violation: self.violation(&state),
            post: state.clone(),
        };

        let mut odometer = vec![0usize; self.systems.len()];
        loop {
            let combo: ActionMap = self
                .systems
                .iter()
                .zip(&odometer)
                .map(|((system, levels), &i)| (system.clone(), levels[i]))
                .collect();
            let projection = self.project(&state, &combo);

            let capped = projection.feasible && self.horizon_cap_s.is_some_and(|cap| projection.time > cap);
            if !capped {
                let score = self.score(&projection, &combo);
                if score.cmp(&best_score) == Ordering::Less {
                    best_score = score;
                    best_actions = combo;
                    best_projection = projection;
                }
            }

            if !advance(&mut odometer, &self.systems) {
                break;
            }
        }

        Decision {
            mode: DecisionMode::Optimized,
            actions: best_actions,
            post_metrics: best_projection.post,
            violation: best_projection.violation,
            time_to_band_s: best_projection.feasible.then_some(best_projection.time),
        }
    }

    /// Medians for controlled metrics; missing or non-finite values fall back to the centre.
    fn current_state(&self, medians: &MetricValues) -> BTreeMap<String, f64> {
        self.targets
            .iter()
            .map(|(metric, t)| {
                let value = medians.get(metric).copied().filter(|v| v.is_finite()).unwrap_or(t.center);
                (metric.clone(), value)
            })
            .collect()
    }

    fn violation(&self, state: &BTreeMap<String, f64>) -> f64 {
        self.targets
            .iter()
            .map(|(metric, t)| t.band.violation(state[metric]))
            .sum()
    }

    fn rates(&self, combo: &ActionMap) -> (BTreeMap<&str, f64>, f64, f64) {
        let mut net: BTreeMap<&str, f64> = self.targets.keys().map(|m| (m.as_str(), 0.0)).collect();
        let (mut energy, mut water) = (0.0, 0.0);
        for (system, level) in combo {
            let Some(row) = self.effects.row(system, *level) else {
                continue;
            };
            for (metric, rate) in net.iter_mut() {
                *rate += row.rate(metric);
            }
            energy += row.energy_consumption;
            water += row.water_consumption;
        }
        (net, energy, water)
    }

    fn project(&self, state: &BTreeMap<String, f64>, combo: &ActionMap) -> Projection {
        let (net, _, _) = self.rates(combo);
        let mut t_req: f64 = 0.0;
        let mut t_max = f64::INFINITY;
        let mut infeasible = false;

        for (metric, t) in &self.targets {
            let x = state[metric];
            let dx = net[metric.as_str()];
            if x < t.band.lo {
                if dx > 0.0 {
                    t_req = t_req.max((t.band.lo - x) / dx);
                } else {
                    infeasible = true;
                }
            } else if x > t.band.hi {
                if dx < 0.0 {
                    t_req = t_req.max((x - t.band.hi) / -dx);
                } else {
                    infeasible = true;
                }
            } else if dx > 0.0 {
                t_max = t_max.min((t.band.hi - x) / dx);
            } else if dx < 0.0 {
                t_max = t_max.min((x - t.band.lo) / -dx);
            }
        }

        if infeasible || t_req > t_max {
            return Projection {
                feasible: false,
                time: f64::INFINITY,
                violation: self.violation(state),
                post: state.clone(),
            };
        }

        let time = t_req.max(0.0);
        let post: BTreeMap<String, f64> = state
            .iter()
            .map(|(metric, x)| (metric.clone(), x + net[metric.as_str()] * time))
            .collect();
        Projection {
            feasible: true,
            time,
            violation: self.violation(&post),
            post,
        }
    }

    fn score(&self, projection: &Projection, combo: &ActionMap) -> Score {
        if !projection.feasible {
            return Score {
                infeasible: true,
                time: f64::INFINITY,
                energy: projection.violation,
                water: 0.0,
            };
        }
        let (_, e_rate, w_rate) = self.rates(combo);
        Score {
            infeasible: false,
            time: projection.time,
            energy: self.weights.energy * e_rate * projection.time,
            water: self.weights.water * w_rate * projection.time,
        }
    }
}

/// Moves the odometer to the next combination; `false` once every one was visited.
fn advance(odometer: &mut [usize], systems: &[(String, Vec<u8>)]) -> bool {
    for (digit, (_, levels)) in odometer.iter_mut().zip(systems).rev() {
        *digit += 1;
        if *digit < levels.len() {
            return true;
        }
        *digit = 0;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use greenbox_devkit::{effects_table, thresholds};

    fn medians(values: &[(&str, f64)]) -> MetricValues {
        values.iter().map(|(m, v)| (m.to_string(), *v)).collect()
    }

    fn climate() -> ThresholdMap {
        thresholds(&[
            ("temperature", 18.0, 26.0, 0.5),
            ("humidity", 60.0, 80.0, 2.0),
            ("light", 5000.0, 15000.0, 50.0),
            ("pH", 5.8, 6.5, 0.0),
        ])
        .unwrap()
    }

    fn ventilation_only() -> EffectsTable {
        effects_table(&[
            ("ventilation_system", 50, &[("temperature", -0.008), ("energy_consumption", 0.1)]),
            ("ventilation_system", 100, &[("temperature", -0.0167), ("energy_consumption", 0.2)]),
            ("illumination_system", 100, &[("light", 500.0)]),
        ])
        .unwrap()
    }

    #[test]
    fn holds_when_everything_is_in_band() {
        let opt = MainOptimizer::new(&climate(), &ventilation_only(), Weights::default(), None);
        let current = ActionMap::from([("ventilation_system".to_string(), 50)]);
        let d = opt.decide(&medians(&[("temperature", 22.0), ("humidity", 70.0)]), &current);
        assert_eq!(d.mode, DecisionMode::Hold);
        assert_eq!(d.actions, current);
        assert_eq!(d.violation, 0.0);
    }

    #[test]
    fn cools_down_with_full_ventilation() {
        let opt = MainOptimizer::new(&climate(), &ventilation_only(), Weights::default(), None);
        let d = opt.decide(&medians(&[("temperature", 29.0), ("humidity", 70.0)]), &ActionMap::new());
        assert_eq!(d.mode, DecisionMode::Optimized);
        assert_eq!(d.actions, ActionMap::from([("ventilation_system".to_string(), 100)]));
        assert!(d.post_metrics["temperature"] <= 25.5 + 1e-9);
        assert!(d.violation < 1e-9);
        let t = d.time_to_band_s.unwrap();
        assert!((t - 3.5 / 0.0167).abs() < 1e-6);
    }

    #[test]
    fn missing_medians_use_threshold_center() {
        let opt = MainOptimizer::new(&climate(), &ventilation_only(), Weights::default(), None);
        let d = opt.decide(&medians(&[("temperature", f64::NAN)]), &ActionMap::new());
        assert_eq!(d.mode, DecisionMode::Hold);
        assert_eq!(d.post_metrics["temperature"], 22.0);
        assert_eq!(d.post_metrics["humidity"], 70.0);
        assert!(!d.post_metrics.contains_key("light"));
        assert!(!d.post_metrics.contains_key("pH"));
    }

    #[test]
    fn empty_actuator_set_holds_with_empty_map() {
        let opt = MainOptimizer::new(&climate(), &EffectsTable::default(), Weights::default(), None);
        let d = opt.decide(&medians(&[("temperature", 30.0)]), &ActionMap::new());
        assert_eq!(d.mode, DecisionMode::Hold);
        assert!(d.actions.is_empty());
        assert_eq!(d.violation, 4.5);
    }

    #[test]
    fn infeasible_returns_best_effort_with_violation() {
        // only heating is available while the greenhouse is too hot
        let effects = effects_table(&[("heating_system", 100, &[("temperature", 0.02)])]).unwrap();
        let opt = MainOptimizer::new(&climate(), &effects, Weights::default(), None);
        let d = opt.decide(&medians(&[("temperature", 27.0), ("humidity", 70.0)]), &ActionMap::new());
        assert_eq!(d.mode, DecisionMode::Optimized);
        assert_eq!(d.actions, ActionMap::from([("heating_system".to_string(), 0)]));
        assert!((d.violation - 1.5).abs() < 1e-9);
        assert_eq!(d.time_to_band_s, None);
        assert_eq!(d.post_metrics["temperature"], 27.0);
    }

    #[test]
    fn energy_breaks_time_ties() {
        let effects = effects_table(&[
            ("ventilation_system", 50, &[("temperature", -0.01), ("energy_consumption", 0.5)]),
            ("ventilation_system", 100, &[("temperature", -0.01), ("energy_consumption", 0.1)]),
        ])
        .unwrap();
        let opt = MainOptimizer::new(&climate(), &effects, Weights::default(), None);
        let d = opt.decide(&medians(&[("temperature", 26.5), ("humidity", 70.0)]), &ActionMap::new());
        assert_eq!(d.actions["ventilation_system"], 100);
    }

    #[test]
    fn faster_combination_wins_and_cap_drops_slow_ones() {
        let effects = effects_table(&[
            ("fan_a", 100, &[("temperature", -0.01), ("energy_consumption", 0.5)]),
            ("fan_b", 100, &[("temperature", -0.01), ("energy_consumption", 0.1)]),
        ])
        .unwrap();
        let opt = MainOptimizer::new(&climate(), &effects, Weights::default(), None);
        let d = opt.decide(&medians(&[("temperature", 26.5), ("humidity", 70.0)]), &ActionMap::new());
        assert_eq!(d.actions["fan_a"], 100);
        assert_eq!(d.actions["fan_b"], 100);
        assert!((d.time_to_band_s.unwrap() - 50.0).abs() < 1e-9);

        let capped = MainOptimizer::new(&climate(), &effects, Weights::default(), Some(10.0));
        let d = capped.decide(&medians(&[("temperature", 26.5), ("humidity", 70.0)]), &ActionMap::new());
        assert_eq!(d.time_to_band_s, None);
        assert_eq!(d.actions["fan_a"], 0);
    }

    #[test]
    fn in_band_metric_limits_the_horizon() {
        // ventilation dries the air too fast: humidity would leave its band first
        let effects = effects_table(&[("ventilation_system", 100, &[("temperature", -0.01), ("humidity", -1.0)])])
            .unwrap();
        let opt = MainOptimizer::new(&climate(), &effects, Weights::default(), None);
        let d = opt.decide(&medians(&[("temperature", 27.0), ("humidity", 63.0)]), &ActionMap::new());
        assert_eq!(d.time_to_band_s, None);
        assert_eq!(d.actions["ventilation_system"], 0);
    }

    #[test]
    fn odometer_visits_every_combination() {
        let systems = vec![("a".to_string(), vec![0, 50, 100]), ("b".to_string(), vec![0, 100])];
        let mut odometer = vec![0, 0];
        let mut seen = 1;
        while advance(&mut odometer, &systems) {
            seen += 1;
        }
        assert_eq!(seen, 6);
        assert_eq!(odometer, vec![0, 0]);
    }

    #[test]
    fn scope_excludes_light_and_ph() {
        assert!(!is_controlled_metric("PH"));
        assert!(!is_controlled_metric("light"));
        assert!(is_controlled_metric("soil_humidity"));
        assert!(!is_controlled_system("illumination_system"));
        assert!(!is_controlled_system("lighting_rig"));
        assert!(is_controlled_system("ventilation_system"));
    }
}
