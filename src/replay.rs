//! Tick-by-tick playback of a single genome for front-ends.
//!
//! The replay owns a clone of the genome and its own arena and rng, so stepping it
//! never touches a live population.

use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Serialize;

use crate::error::Result;
use crate::game::{EpisodeEnd, EpisodeOutcome, EpisodeSettings, Game, TickOutcome};
use crate::genome::Genome;
use crate::pos::Pos;
use crate::snake::Snake;

/// Everything a renderer needs for one tick.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Frame {
    pub grid_size: usize,
    /// Head first.
    pub body: Vec<Pos>,
    pub food: Vec<Pos>,
    pub walls: Vec<Pos>,
    pub poisons: Vec<Pos>,
    pub bonuses: Vec<Pos>,
    pub fitness: f32,
    pub steps: u32,
    pub hunger: u32,
    pub alive: bool,
    pub outcome: Option<EpisodeEnd>,
}

pub struct Replay {
    snake: Snake,
    game: Game,
    rng: SmallRng,
}

impl Replay {
    pub fn new(genome: &Genome, settings: EpisodeSettings, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let mut snake = Snake::new(genome.clone(), settings.grid_size);
        let game = Game::start(settings, &mut snake, &mut rng);
        Self { snake, game, rng }
    }

    /// Advances exactly one tick; a finished replay stays finished.
    pub fn step(&mut self) -> Result<TickOutcome> {
        self.game.tick(&mut self.snake, &mut self.rng)
    }

    pub fn is_finished(&self) -> bool {
        self.game.outcome().is_some()
    }

    pub fn frame(&self) -> Frame {
        Frame {
            grid_size: self.game.settings().grid_size,
            body: self.snake.body().collect(),
            food: self.game.food().to_vec(),
            walls: self.game.walls(),
            poisons: self.game.poisons().to_vec(),
            bonuses: self.game.bonuses().to_vec(),
            fitness: self.snake.fitness(),
            steps: self.snake.steps(),
            hunger: self.snake.hunger(),
            alive: self.snake.is_alive(),
            outcome: self.game.outcome(),
        }
    }

    /// Steps until the episode ends and returns its summary.
    pub fn run_to_end(&mut self) -> Result<EpisodeOutcome> {
        while self.step()? == TickOutcome::Running {}
        Ok(self.game.summary(&self.snake))
    }
}
