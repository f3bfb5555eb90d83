//! The agent: one genome plus the mutable state of the episode it is playing.

use ahash::AHashSet;
use std::collections::VecDeque;

use crate::config::{HungerConfig, RewardConfig, SensorMode};
use crate::genome::Genome;
use crate::pos::{Dir, Pos};

pub const START_LENGTH: usize = 3;

#[derive(Clone, Debug)]
pub struct Snake {
    genome: Genome,
    grid_size: usize,
    pub(crate) body: VecDeque<Pos>,
    dir: Dir,
    alive: bool,
    fitness: f32,
    /// Ticks since the last meal.
    pub(crate) hunger: u32,
    steps: u32,
}

impl Snake {
    pub fn new(genome: Genome, grid_size: usize) -> Self {
        let mut snake = Self {
            genome,
            grid_size,
            body: VecDeque::new(),
            dir: Dir::Right,
            alive: true,
            fitness: 0.0,
            hunger: 0,
            steps: 0,
        };
        snake.reset(grid_size);
        snake
    }

    /// Fresh body and counters for a new episode. The three starting cells lie on
    /// the middle row, head first, heading right.
    pub fn reset(&mut self, grid_size: usize) {
        let row = (grid_size / 2) as i32;
        let head_x = (grid_size / 2).max(START_LENGTH - 1) as i32;
        self.grid_size = grid_size;
        self.body = (0..START_LENGTH as i32)
            .map(|i| Pos::new(head_x - i, row))
            .collect();
        self.dir = Dir::Right;
        self.alive = true;
        self.fitness = 0.0;
        self.hunger = 0;
        self.steps = 0;
    }

    pub fn genome(&self) -> &Genome {
        &self.genome
    }

    pub fn head(&self) -> Pos {
        self.body[0]
    }

    pub fn body(&self) -> impl Iterator<Item = Pos> + '_ {
        self.body.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn dir(&self) -> Dir {
        self.dir
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn fitness(&self) -> f32 {
        self.fitness
    }

    pub fn hunger(&self) -> u32 {
        self.hunger
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size
    }

    /// Cells that still block the head this tick: the whole body minus the tail,
    /// which moves away as the head advances.
    fn blocking_body(&self) -> AHashSet<Pos> {
        let keep = self.body.len().saturating_sub(1);
        self.body.iter().take(keep).copied().collect()
    }

    fn is_free(&self, p: Pos, body: &AHashSet<Pos>, obstacles: &AHashSet<Pos>) -> bool {
        p.in_bounds(self.grid_size) && !body.contains(&p) && !obstacles.contains(&p)
    }

    /// Builds the sensor vector for the current state; its width follows `mode`.
    pub fn sense(
        &self,
        food: Option<Pos>,
        obstacles: &AHashSet<Pos>,
        mode: SensorMode,
        starvation_timeout: u32,
    ) -> Vec<f32> {
        let mut sensors = Vec::with_capacity(mode.width());
        let head = self.head();

        let mut to_food = [0.0f32; 4];
        if let Some(food) = food {
            let (dx, dy) = (food.x - head.x, food.y - head.y);
            if dx.abs() > dy.abs() {
                to_food[if dx > 0 { Dir::Right } else { Dir::Left }.index()] = 1.0;
            } else if dx != 0 || dy != 0 {
                to_food[if dy > 0 { Dir::Down } else { Dir::Up }.index()] = 1.0;
            }
        }
        sensors.extend_from_slice(&to_food);

        let body = self.blocking_body();
        for dir in Dir::ALL {
            let mut dist = 0u32;
            let mut cell = head.step(dir);
            while self.is_free(cell, &body, obstacles) {
                dist += 1;
                cell = cell.step(dir);
            }
            sensors.push(1.0 / (1.0 + dist as f32));
        }

        if mode == SensorMode::Basic {
            return sensors;
        }

        let area = (self.grid_size * self.grid_size) as f32;
        let max_dist = (2 * (self.grid_size - 1)).max(1) as f32;
        let food_dist = food.map_or(0.0, |f| head.manhattan(f) as f32 / max_dist);
        let free_adjacent = Dir::ALL
            .iter()
            .filter(|d| self.is_free(head.step(**d), &body, obstacles))
            .count();
        sensors.push(self.len() as f32 / area);
        sensors.push((self.hunger as f32 / starvation_timeout.max(1) as f32).min(1.0));
        sensors.push(food_dist);
        sensors.push(free_adjacent as f32 / 4.0);

        if mode == SensorMode::Full {
            let mut heading = [0.0f32; 4];
            heading[self.dir.index()] = 1.0;
            sensors.extend_from_slice(&heading);
        }
        sensors
    }

    /// Moves the head one cell. A collision kills the snake and leaves the body
    /// unchanged. On success the caller trims the tail unless food was eaten.
    pub fn act(&mut self, dir: Dir, obstacles: &AHashSet<Pos>) -> bool {
        if !self.alive {
            return false;
        }
        self.dir = dir;
        self.hunger += 1;
        let new_head = self.head().step(dir);
        if !self.is_free(new_head, &self.blocking_body(), obstacles) {
            self.alive = false;
            return false;
        }
        self.body.push_front(new_head);
        self.steps += 1;
        true
    }

    pub fn remove_tail(&mut self) {
        if self.body.len() > 1 {
            self.body.pop_back();
        }
    }

    /// Food reward plus a bonus that shrinks with every tick spent hungry.
    pub fn eat(&mut self, rewards: &RewardConfig) {
        let speed_bonus = rewards.speed_bonus_window.saturating_sub(self.hunger) as f32;
        self.fitness += rewards.food + speed_bonus;
        self.hunger = 0;
    }

    pub fn accumulate_survival_reward(&mut self, rewards: &RewardConfig, hunger: &HungerConfig) {
        if !self.alive {
            return;
        }
        self.fitness += rewards.survival;
        if self.hunger > hunger.soft_threshold {
            let over = (self.hunger - hunger.soft_threshold) as f32;
            let soft = hunger.soft_threshold.max(1) as f32;
            self.fitness -= rewards.hunger_penalty * (1.0 + over / soft);
        }
    }

    /// Terminal score: long hunger at the end of the episode costs points, very long
    /// hunger halves the score, and the result is never negative.
    pub fn final_fitness(&self, hunger: &HungerConfig) -> f32 {
        let mut fitness = self.fitness;
        if self.hunger > hunger.severe_threshold {
            fitness *= 0.5;
        } else if self.hunger > hunger.penalty_threshold {
            fitness -= (self.hunger - hunger.penalty_threshold) as f32 * hunger.penalty_per_tick;
        }
        fitness.max(0.0)
    }

    pub(crate) fn add_reward(&mut self, amount: f32) {
        self.fitness += amount;
    }

    pub(crate) fn kill(&mut self) {
        self.alive = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genome::NetworkShape;

    fn snake(grid: usize) -> Snake {
        Snake::new(Genome::constant(&NetworkShape::new(8, vec![]), 0), grid)
    }

    fn no_obstacles() -> AHashSet<Pos> {
        AHashSet::new()
    }

    #[test]
    fn reset_centers_three_cells() {
        let s = snake(5);
        let body: Vec<Pos> = s.body().collect();
        assert_eq!(body, vec![Pos::new(2, 2), Pos::new(1, 2), Pos::new(0, 2)]);
        assert_eq!(s.dir(), Dir::Right);
        assert!(s.is_alive());
        assert_eq!(s.hunger(), 0);

        let tiny = snake(3);
        assert!(tiny.body().all(|p| p.in_bounds(3)));
        assert_eq!(tiny.len(), START_LENGTH);
    }

    #[test]
    fn reset_allocates_a_fresh_body() {
        let mut s = snake(7);
        let before: Vec<Pos> = s.body().collect();
        assert!(s.act(Dir::Up, &no_obstacles()));
        s.reset(7);
        assert_eq!(s.body().collect::<Vec<_>>(), before);
        assert_eq!(s.steps(), 0);
    }

    #[test]
    fn food_directly_below_points_down() {
        let s = snake(5);
        let sensors = s.sense(Some(Pos::new(2, 3)), &no_obstacles(), SensorMode::Basic, 80);
        assert_eq!(&sensors[..4], &[0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn horizontal_wins_only_when_strictly_larger() {
        let s = snake(9);
        let head = s.head();
        let diag = Pos::new(head.x + 2, head.y - 2);
        let sensors = s.sense(Some(diag), &no_obstacles(), SensorMode::Basic, 80);
        assert_eq!(&sensors[..4], &[1.0, 0.0, 0.0, 0.0]);

        let right = Pos::new(head.x + 3, head.y - 2);
        let sensors = s.sense(Some(right), &no_obstacles(), SensorMode::Basic, 80);
        assert_eq!(&sensors[..4], &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn dangers_are_inverse_distances() {
        let s = snake(5);
        let sensors = s.sense(None, &no_obstacles(), SensorMode::Basic, 80);
        // up, down, right have two free cells; left is the neck.
        assert_eq!(&sensors[4..], &[1.0 / 3.0, 1.0 / 3.0, 1.0, 1.0 / 3.0]);

        let wall: AHashSet<Pos> = [Pos::new(3, 2)].into_iter().collect();
        let sensors = s.sense(None, &wall, SensorMode::Basic, 80);
        assert_eq!(sensors[4 + Dir::Right.index()], 1.0);
    }

    #[test]
    fn ray_passes_through_the_vacating_tail() {
        let mut s = snake(5);
        s.body = [Pos::new(1, 1), Pos::new(2, 1), Pos::new(2, 2), Pos::new(1, 2)]
            .into_iter()
            .collect();
        let sensors = s.sense(None, &no_obstacles(), SensorMode::Basic, 80);
        assert_eq!(sensors[4 + Dir::Down.index()], 0.25);
    }

    #[test]
    fn sensor_width_follows_mode() {
        let s = snake(10);
        for mode in [SensorMode::Basic, SensorMode::Extended, SensorMode::Full] {
            let sensors = s.sense(Some(Pos::new(0, 0)), &no_obstacles(), mode, 80);
            assert_eq!(sensors.len(), mode.width());
        }
        let full = s.sense(Some(Pos::new(0, 0)), &no_obstacles(), SensorMode::Full, 80);
        assert_eq!(full[8], 3.0 / 100.0);
        assert_eq!(full[11], 0.75);
        assert_eq!(&full[12..], &[0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn moving_off_the_edge_kills_without_growing() {
        let mut s = snake(5);
        s.body = [Pos::new(4, 2), Pos::new(3, 2), Pos::new(2, 2)].into_iter().collect();
        let before: Vec<Pos> = s.body().collect();
        assert!(!s.act(Dir::Right, &no_obstacles()));
        assert!(!s.is_alive());
        assert_eq!(s.body().collect::<Vec<_>>(), before);
        assert!(!s.act(Dir::Up, &no_obstacles()));
    }

    #[test]
    fn reversing_into_the_neck_is_a_collision() {
        let mut s = snake(9);
        assert!(!s.act(Dir::Left, &no_obstacles()));
        assert!(!s.is_alive());
    }

    #[test]
    fn chasing_the_tail_is_allowed() {
        let mut s = snake(5);
        s.body = [Pos::new(1, 1), Pos::new(2, 1), Pos::new(2, 2), Pos::new(1, 2)]
            .into_iter()
            .collect();
        assert!(s.act(Dir::Down, &no_obstacles()));
        s.remove_tail();
        assert_eq!(s.head(), Pos::new(1, 2));
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn obstacles_block_movement() {
        let mut s = snake(9);
        let head = s.head();
        let wall: AHashSet<Pos> = [head.step(Dir::Up)].into_iter().collect();
        assert!(!s.act(Dir::Up, &wall));
        assert!(!s.is_alive());
    }

    #[test]
    fn eating_rewards_speed_and_resets_hunger() {
        let rewards = RewardConfig::default();
        let mut s = snake(9);
        s.hunger = 10;
        s.eat(&rewards);
        assert_eq!(s.fitness(), 150.0 + 40.0);
        assert_eq!(s.hunger(), 0);

        s.hunger = 200;
        s.eat(&rewards);
        assert_eq!(s.fitness(), 190.0 + 150.0);
    }

    #[test]
    fn survival_reward_turns_into_penalty_when_hungry() {
        let rewards = RewardConfig::default();
        let hunger = HungerConfig::default();
        let mut s = snake(9);
        s.accumulate_survival_reward(&rewards, &hunger);
        assert!((s.fitness() - 0.2).abs() < 1e-6);

        s.hunger = hunger.soft_threshold + 25;
        let before = s.fitness();
        s.accumulate_survival_reward(&rewards, &hunger);
        assert!((s.fitness() - (before + 0.2 - 1.5)).abs() < 1e-5);

        s.kill();
        let dead = s.fitness();
        s.accumulate_survival_reward(&rewards, &hunger);
        assert_eq!(s.fitness(), dead);
    }

    #[test]
    fn final_fitness_tiers() {
        let hunger = HungerConfig::default();
        let mut s = snake(9);
        s.add_reward(100.0);

        s.hunger = 60;
        assert_eq!(s.final_fitness(&hunger), 100.0);
        s.hunger = 65;
        assert!((s.final_fitness(&hunger) - 97.0).abs() < 1e-4);
        s.hunger = 71;
        assert_eq!(s.final_fitness(&hunger), 50.0);

        s.add_reward(-500.0);
        s.hunger = 0;
        assert_eq!(s.final_fitness(&hunger), 0.0);
    }
}
