//! Run configuration. Every numeric constant that shapes the fitness landscape
//! lives here so that it can be tuned from a TOML file or the command line.

use anyhow::{Context, Result as AnyResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, SnakeError};

/// Width of the sensor vector fed to the genome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorMode {
    /// Food direction + dangers.
    Basic,
    /// Basic + length, hunger, food distance, free neighbours.
    Extended,
    /// Extended + current heading.
    Full,
}

impl SensorMode {
    pub fn width(self) -> usize {
        match self {
            SensorMode::Basic => 8,
            SensorMode::Extended => 12,
            SensorMode::Full => 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub population_size: usize,
    pub elite_size: usize,
    pub grid_size: usize,
    pub max_steps: usize,
    /// Master seed; `None` draws one from the OS.
    pub seed: Option<u64>,
    /// Evaluate the agents of a generation on the rayon pool.
    pub parallel: bool,
    pub network: NetworkConfig,
    pub mutation: MutationConfig,
    pub rewards: RewardConfig,
    pub hunger: HungerConfig,
    pub difficulty: DifficultyConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub sensors: SensorMode,
    pub hidden_layers: Vec<usize>,
    pub input_clip: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationConfig {
    /// Per-weight probability of a gaussian nudge.
    pub rate: f32,
    /// Standard deviation of the nudge.
    pub strength: f32,
    /// Probability that a child also gets the large re-randomizing pass.
    pub catastrophic_chance: f32,
    /// Fraction of weights re-drawn by that pass.
    pub catastrophic_fraction: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    pub food: f32,
    /// Ticks after a meal during which the next meal still earns a speed bonus.
    pub speed_bonus_window: u32,
    pub survival: f32,
    /// Ticks between two survival-reward accruals.
    pub survival_interval: u32,
    pub hunger_penalty: f32,
    /// Upper bound of the per-tick proximity shaping reward.
    pub proximity: f32,
    pub victory_bonus: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HungerConfig {
    pub starvation_timeout: u32,
    /// Past this, survival accruals carry a penalty.
    pub soft_threshold: u32,
    /// Past this, the terminal fitness loses `penalty_per_tick` per extra tick.
    pub penalty_threshold: u32,
    pub penalty_per_tick: f32,
    /// Past this, the terminal fitness is halved instead.
    pub severe_threshold: u32,
}

/// Generation-scaled difficulty. Every policy is off unless its interval is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DifficultyConfig {
    pub grid_shrink_interval: Option<u32>,
    pub min_grid_size: usize,
    pub step_decay_interval: Option<u32>,
    pub step_decay: f32,
    pub min_step_fraction: f32,
    pub food_interval: Option<u32>,
    pub max_food: usize,
    pub wall_interval: Option<u32>,
    pub max_walls: usize,
    pub moving_walls_from: Option<u32>,
    pub poison_from: Option<u32>,
    pub poison_interval: u32,
    pub bonus_from: Option<u32>,
    pub bonus_interval: u32,
    pub bonus_multiplier: f32,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            population_size: 100,
            elite_size: 10,
            grid_size: 20,
            max_steps: 500,
            seed: None,
            parallel: true,
            network: NetworkConfig::default(),
            mutation: MutationConfig::default(),
            rewards: RewardConfig::default(),
            hunger: HungerConfig::default(),
            difficulty: DifficultyConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            sensors: SensorMode::Full,
            hidden_layers: vec![32, 16],
            input_clip: 10.0,
        }
    }
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            rate: 0.1,
            strength: 0.2,
            catastrophic_chance: 0.1,
            catastrophic_fraction: 0.3,
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            food: 150.0,
            speed_bonus_window: 50,
            survival: 0.2,
            survival_interval: 1,
            hunger_penalty: 1.0,
            proximity: 5.0,
            victory_bonus: 10_000.0,
        }
    }
}

impl Default for HungerConfig {
    fn default() -> Self {
        Self {
            starvation_timeout: 80,
            soft_threshold: 50,
            penalty_threshold: 60,
            penalty_per_tick: 0.6,
            severe_threshold: 70,
        }
    }
}

impl Default for DifficultyConfig {
    fn default() -> Self {
        Self {
            grid_shrink_interval: None,
            min_grid_size: 12,
            step_decay_interval: None,
            step_decay: 0.1,
            min_step_fraction: 0.6,
            food_interval: None,
            max_food: 3,
            wall_interval: None,
            max_walls: 25,
            moving_walls_from: None,
            poison_from: None,
            poison_interval: 20,
            bonus_from: None,
            bonus_interval: 30,
            bonus_multiplier: 0.5,
        }
    }
}

fn check_probability(name: &str, value: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(SnakeError::invariant(format!(
            "{name} must be in [0, 1], got {value}"
        )));
    }
    Ok(())
}

impl EvolutionConfig {
    /// Checked once before any generation runs.
    pub fn validate(&self) -> Result<()> {
        if self.population_size == 0 {
            return Err(SnakeError::invariant("population_size must be at least 1"));
        }
        if self.elite_size == 0 {
            return Err(SnakeError::invariant("elite_size must be at least 1"));
        }
        if self.elite_size > self.population_size {
            return Err(SnakeError::invariant(format!(
                "elite_size ({}) cannot exceed population_size ({})",
                self.elite_size, self.population_size
            )));
        }
        if self.grid_size < 3 {
            return Err(SnakeError::invariant(format!(
                "grid_size must be at least 3, got {}",
                self.grid_size
            )));
        }
        if self.max_steps == 0 {
            return Err(SnakeError::invariant("max_steps must be at least 1"));
        }
        if self.hunger.starvation_timeout == 0 {
            return Err(SnakeError::invariant("starvation_timeout must be at least 1"));
        }
        if self.network.hidden_layers.contains(&0) {
            return Err(SnakeError::invariant("hidden layers cannot be zero-width"));
        }
        if !(self.network.input_clip.is_finite() && self.network.input_clip > 0.0) {
            return Err(SnakeError::invariant("input_clip must be positive"));
        }
        let m = &self.mutation;
        check_probability("mutation.rate", m.rate)?;
        check_probability("mutation.catastrophic_chance", m.catastrophic_chance)?;
        check_probability("mutation.catastrophic_fraction", m.catastrophic_fraction)?;
        if !(m.strength.is_finite() && m.strength >= 0.0) {
            return Err(SnakeError::invariant(format!(
                "mutation.strength must be non-negative, got {}",
                m.strength
            )));
        }
        if self.rewards.survival_interval == 0 {
            return Err(SnakeError::invariant("rewards.survival_interval must be at least 1"));
        }
        let d = &self.difficulty;
        if d.min_grid_size < 3 {
            return Err(SnakeError::invariant("difficulty.min_grid_size must be at least 3"));
        }
        check_probability("difficulty.step_decay", d.step_decay)?;
        check_probability("difficulty.min_step_fraction", d.min_step_fraction)?;
        if d.max_food == 0 {
            return Err(SnakeError::invariant("difficulty.max_food must be at least 1"));
        }
        let zero_interval = [
            d.grid_shrink_interval,
            d.step_decay_interval,
            d.food_interval,
            d.wall_interval,
        ]
        .contains(&Some(0));
        if zero_interval || d.poison_interval == 0 || d.bonus_interval == 0 {
            return Err(SnakeError::invariant("difficulty intervals must be at least 1"));
        }
        Ok(())
    }

    pub fn load(path: &Path) -> AnyResult<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> AnyResult<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }
}
