//! One episode arena: food, walls and hazards around a single snake, advanced one
//! tick at a time.

use ahash::AHashSet;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{EvolutionConfig, HungerConfig, RewardConfig, SensorMode};
use crate::error::Result;
use crate::pos::{Dir, Pos};
use crate::snake::Snake;

/// Half-width of the block around the start cell kept clear of walls.
const START_CLEARANCE: i32 = 3;

/// Everything one episode needs to know, resolved for a given generation.
#[derive(Clone, Debug, PartialEq)]
pub struct EpisodeSettings {
    pub grid_size: usize,
    pub max_steps: usize,
    pub sensors: SensorMode,
    pub rewards: RewardConfig,
    pub hunger: HungerConfig,
    pub food_target: usize,
    /// Total walls, moving ones included.
    pub walls: usize,
    pub moving_walls: usize,
    pub poisons: usize,
    pub bonuses: usize,
    pub bonus_multiplier: f32,
}

impl EpisodeSettings {
    pub fn from_config(config: &EvolutionConfig) -> Self {
        Self::for_generation(config, 0)
    }

    pub fn for_generation(config: &EvolutionConfig, generation: u32) -> Self {
        let d = &config.difficulty;

        let grid_size = match d.grid_shrink_interval {
            Some(n) => config
                .grid_size
                .saturating_sub((generation / n) as usize)
                .max(d.min_grid_size.min(config.grid_size)),
            None => config.grid_size,
        };

        let max_steps = match d.step_decay_interval {
            Some(n) => {
                let fraction =
                    (1.0 - d.step_decay * (generation / n) as f32).max(d.min_step_fraction);
                ((config.max_steps as f32 * fraction).round() as usize).max(1)
            }
            None => config.max_steps,
        };

        let food_target = d
            .food_interval
            .map_or(1, |n| (1 + (generation / n) as usize).min(d.max_food));

        let walls = d
            .wall_interval
            .map_or(0, |n| ((generation / n) as usize).min(d.max_walls));
        let moving_walls = match d.moving_walls_from {
            Some(from) if generation > from => walls.saturating_sub(5) / 3,
            _ => 0,
        };

        let poisons = match d.poison_from {
            Some(from) if generation > from => ((generation - from) / d.poison_interval) as usize,
            _ => 0,
        };
        let bonuses = match d.bonus_from {
            Some(from) if generation > from => ((generation - from) / d.bonus_interval) as usize,
            _ => 0,
        };

        Self {
            grid_size,
            max_steps,
            sensors: config.network.sensors,
            rewards: config.rewards,
            hunger: config.hunger,
            food_target,
            walls,
            moving_walls,
            poisons,
            bonuses,
            bonus_multiplier: d.bonus_multiplier,
        }
    }

    pub fn area(&self) -> usize {
        self.grid_size * self.grid_size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EpisodeEnd {
    Collided,
    Starved,
    Poisoned,
    Victory,
    StepLimit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TickOutcome {
    Running,
    Finished(EpisodeEnd),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpisodeOutcome {
    pub fitness: f32,
    pub length: usize,
    pub steps: u32,
    pub end: EpisodeEnd,
}

#[derive(Clone, Copy, Debug, PartialEq)]
struct MovingWall {
    pos: Pos,
    dx: i32,
    dy: i32,
}

impl MovingWall {
    /// Bounces inside the inner border of the grid.
    fn advance(&mut self, grid_size: usize) {
        let hi = grid_size as i32 - 2;
        let bounce = |v: i32, d: &mut i32| {
            let mut next = v + *d;
            if next < 1 || next > hi {
                *d = -*d;
                next = v + *d;
            }
            next.clamp(1, hi.max(1))
        };
        self.pos = Pos::new(bounce(self.pos.x, &mut self.dx), bounce(self.pos.y, &mut self.dy));
    }
}

#[derive(Clone, Debug)]
pub struct Game {
    settings: EpisodeSettings,
    food: Vec<Pos>,
    walls: Vec<Pos>,
    moving_walls: Vec<MovingWall>,
    poisons: Vec<Pos>,
    bonuses: Vec<Pos>,
    obstacles: AHashSet<Pos>,
    ticks: usize,
    outcome: Option<EpisodeEnd>,
}

impl Game {
    /// Resets `snake` and lays out a fresh arena around it.
    pub fn start<R: Rng>(settings: EpisodeSettings, snake: &mut Snake, rng: &mut R) -> Self {
        snake.reset(settings.grid_size);
        let mut game = Self {
            settings,
            food: Vec::new(),
            walls: Vec::new(),
            moving_walls: Vec::new(),
            poisons: Vec::new(),
            bonuses: Vec::new(),
            obstacles: AHashSet::new(),
            ticks: 0,
            outcome: None,
        };
        game.place_walls(snake, rng);
        game.refresh_obstacles();
        game.replenish_food(snake, rng);
        game.poisons = game.pick_free_cells(snake, game.settings.poisons, rng);
        game.bonuses = game.pick_free_cells(snake, game.settings.bonuses, rng);
        game
    }

    fn place_walls<R: Rng>(&mut self, snake: &Snake, rng: &mut R) {
        if self.settings.walls == 0 {
            return;
        }
        let grid = self.settings.grid_size as i32;
        let center = grid / 2;
        let body: AHashSet<Pos> = snake.body().collect();
        let clear_of_start = |p: &Pos| {
            (p.x - center).abs() >= START_CLEARANCE || (p.y - center).abs() >= START_CLEARANCE
        };

        let moving = self.settings.moving_walls.min(self.settings.walls);
        let inner: Vec<Pos> = (1..grid - 1)
            .flat_map(|y| (1..grid - 1).map(move |x| Pos::new(x, y)))
            .filter(|p| clear_of_start(p) && !body.contains(p))
            .collect();
        self.moving_walls = inner
            .choose_multiple(rng, moving)
            .map(|&pos| {
                let (dx, dy) = Dir::ALL[rng.gen_range(0..Dir::ALL.len())].offset();
                MovingWall { pos, dx, dy }
            })
            .collect();

        let taken: AHashSet<Pos> = self.moving_walls.iter().map(|w| w.pos).collect();
        let candidates: Vec<Pos> = (0..grid)
            .flat_map(|y| (0..grid).map(move |x| Pos::new(x, y)))
            .filter(|p| clear_of_start(p) && !body.contains(p) && !taken.contains(p))
            .collect();
        self.walls = candidates
            .choose_multiple(rng, self.settings.walls - moving)
            .copied()
            .collect();
    }

    fn refresh_obstacles(&mut self) {
        self.obstacles.clear();
        self.obstacles.extend(self.walls.iter().copied());
        self.obstacles.extend(self.moving_walls.iter().map(|w| w.pos));
    }

    fn free_cells(&self, snake: &Snake) -> Vec<Pos> {
        let mut occupied: AHashSet<Pos> = snake.body().collect();
        occupied.extend(self.obstacles.iter().copied());
        occupied.extend(self.food.iter().copied());
        occupied.extend(self.poisons.iter().copied());
        occupied.extend(self.bonuses.iter().copied());
        let grid = self.settings.grid_size as i32;
        (0..grid)
            .flat_map(|y| (0..grid).map(move |x| Pos::new(x, y)))
            .filter(|p| !occupied.contains(p))
            .collect()
    }

    fn pick_free_cells<R: Rng>(&self, snake: &Snake, count: usize, rng: &mut R) -> Vec<Pos> {
        if count == 0 {
            return Vec::new();
        }
        self.free_cells(snake)
            .choose_multiple(rng, count)
            .copied()
            .collect()
    }

    fn replenish_food<R: Rng>(&mut self, snake: &Snake, rng: &mut R) {
        let missing = self.settings.food_target.saturating_sub(self.food.len());
        let fresh = self.pick_free_cells(snake, missing, rng);
        if fresh.len() < missing {
            debug!(missing, placed = fresh.len(), "grid too full to place all food");
        }
        self.food.extend(fresh);
    }

    fn advance_moving_walls(&mut self) {
        if self.moving_walls.is_empty() {
            return;
        }
        for wall in &mut self.moving_walls {
            wall.advance(self.settings.grid_size);
        }
        self.refresh_obstacles();
    }

    fn finish(&mut self, end: EpisodeEnd) -> TickOutcome {
        self.outcome = Some(end);
        TickOutcome::Finished(end)
    }

    fn victory(&mut self, snake: &mut Snake) -> TickOutcome {
        snake.add_reward(self.settings.rewards.victory_bonus);
        snake.kill();
        self.finish(EpisodeEnd::Victory)
    }

    /// Nearest food to `from` by Manhattan distance; earliest placed wins ties.
    pub fn primary_food(&self, from: Pos) -> Option<Pos> {
        self.food.iter().copied().min_by_key(|f| f.manhattan(from))
    }

    /// Advances the episode by one tick: sense, decide, act, then reward.
    pub fn tick<R: Rng>(&mut self, snake: &mut Snake, rng: &mut R) -> Result<TickOutcome> {
        if let Some(end) = self.outcome {
            return Ok(TickOutcome::Finished(end));
        }
        if !snake.is_alive() {
            return Ok(self.finish(EpisodeEnd::Collided));
        }
        if snake.len() == self.settings.area() {
            return Ok(self.victory(snake));
        }
        if snake.hunger() > self.settings.hunger.starvation_timeout {
            snake.kill();
            return Ok(self.finish(EpisodeEnd::Starved));
        }
        if self.ticks >= self.settings.max_steps {
            return Ok(self.finish(EpisodeEnd::StepLimit));
        }

        self.advance_moving_walls();
        let sensors = snake.sense(
            self.primary_food(snake.head()),
            &self.obstacles,
            self.settings.sensors,
            self.settings.hunger.starvation_timeout,
        );
        let action = snake.genome().decide(&sensors, rng)?;
        let dir = Dir::from_index(action).unwrap_or(snake.dir());
        self.ticks += 1;

        if !snake.act(dir, &self.obstacles) {
            return Ok(self.finish(EpisodeEnd::Collided));
        }

        let head = snake.head();
        let ate = match self.food.iter().position(|&f| f == head) {
            Some(i) => {
                self.food.remove(i);
                snake.eat(&self.settings.rewards);
                true
            }
            None => false,
        };

        if self.poisons.contains(&head) {
            snake.kill();
            return Ok(self.finish(EpisodeEnd::Poisoned));
        }
        if let Some(i) = self.bonuses.iter().position(|&b| b == head) {
            self.bonuses.remove(i);
            snake.add_reward(snake.fitness() * self.settings.bonus_multiplier);
        }

        if ate {
            self.replenish_food(snake, rng);
        } else {
            snake.remove_tail();
        }

        if self.ticks % self.settings.rewards.survival_interval as usize == 0 {
            snake.accumulate_survival_reward(&self.settings.rewards, &self.settings.hunger);
        }
        if let Some(food) = self.primary_food(head) {
            let dist = head.manhattan(food) as f32;
            snake.add_reward(self.settings.rewards.proximity / (dist + 1.0));
        }

        if ate && snake.len() == self.settings.area() {
            return Ok(self.victory(snake));
        }
        Ok(TickOutcome::Running)
    }

    /// Terminal summary; only meaningful once `tick` has returned `Finished`.
    pub fn summary(&self, snake: &Snake) -> EpisodeOutcome {
        EpisodeOutcome {
            fitness: snake.final_fitness(&self.settings.hunger),
            length: snake.len(),
            steps: snake.steps(),
            end: self.outcome.unwrap_or(EpisodeEnd::StepLimit),
        }
    }

    pub fn settings(&self) -> &EpisodeSettings {
        &self.settings
    }

    pub fn food(&self) -> &[Pos] {
        &self.food
    }

    /// Static and moving walls at their current cells.
    pub fn walls(&self) -> Vec<Pos> {
        self.walls
            .iter()
            .copied()
            .chain(self.moving_walls.iter().map(|w| w.pos))
            .collect()
    }

    pub fn poisons(&self) -> &[Pos] {
        &self.poisons
    }

    pub fn bonuses(&self) -> &[Pos] {
        &self.bonuses
    }

    pub fn ticks(&self) -> usize {
        self.ticks
    }

    pub fn outcome(&self) -> Option<EpisodeEnd> {
        self.outcome
    }
}

/// Plays one full episode for `snake` and returns its terminal fitness.
pub fn run_episode<R: Rng>(
    snake: &mut Snake,
    settings: &EpisodeSettings,
    rng: &mut R,
) -> Result<EpisodeOutcome> {
    let mut game = Game::start(settings.clone(), snake, rng);
    while game.tick(snake, rng)? == TickOutcome::Running {}
    Ok(game.summary(snake))
}
