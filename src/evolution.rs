//! Generational population manager: evaluate every snake, rank, keep the elite,
//! refill with mutated children.

use rand::rngs::SmallRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::EvolutionConfig;
use crate::error::{Result, SnakeError};
use crate::game::{EpisodeEnd, EpisodeOutcome, EpisodeSettings, run_episode};
use crate::genome::{Genome, NetworkShape};
use crate::snake::Snake;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    /// 1 for the first completed generation.
    pub generation: u32,
    pub best_fitness: f32,
    pub avg_fitness: f32,
}

/// Best genome seen so far, detached from the live population.
#[derive(Clone, Debug, PartialEq)]
pub struct BestGenome {
    pub genome: Genome,
    pub fitness: f32,
    pub generation: u32,
}

/// Consistent view of the run between two generations.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Checkpoint {
    pub generation: u32,
    pub best: Option<BestGenome>,
}

impl Checkpoint {
    pub fn best_fitness(&self) -> f32 {
        self.best.as_ref().map_or(0.0, |b| b.fitness)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GenerationSummary {
    pub record: GenerationRecord,
    pub best_length: usize,
    pub victory: bool,
}

pub struct Evolution {
    config: EvolutionConfig,
    shape: NetworkShape,
    population: Vec<Snake>,
    generation: u32,
    history: Vec<GenerationRecord>,
    best_ever: Option<BestGenome>,
    rng: SmallRng,
}

impl Evolution {
    pub fn new(config: EvolutionConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => SmallRng::from_entropy(),
        };
        let shape = NetworkShape::from_config(&config.network);
        let population = (0..config.population_size)
            .map(|_| Snake::new(Genome::random(&shape, &mut rng), config.grid_size))
            .collect();
        Ok(Self {
            config,
            shape,
            population,
            generation: 0,
            history: Vec::new(),
            best_ever: None,
            rng,
        })
    }

    /// Puts `genome` into slot 0, e.g. when continuing a stored session.
    pub fn seed_genome(&mut self, genome: Genome) -> Result<()> {
        if genome.shape() != &self.shape {
            return Err(SnakeError::invariant(format!(
                "seed genome shape {:?} does not match population shape {:?}",
                genome.shape(),
                self.shape
            )));
        }
        if let Some(slot) = self.population.first_mut() {
            *slot = Snake::new(genome, self.config.grid_size);
        }
        Ok(())
    }

    /// Continues numbering (and the difficulty schedule) after `generation`
    /// already-completed generations.
    pub fn resume_from(&mut self, generation: u32) {
        self.generation = generation;
    }

    /// Episode settings for the generation about to be evaluated.
    pub fn current_settings(&self) -> EpisodeSettings {
        EpisodeSettings::for_generation(&self.config, self.generation)
    }

    /// Plays one episode per snake. Each episode gets its own rng seeded from the
    /// master rng, so the result does not depend on `parallel`.
    pub fn evaluate_generation(&mut self) -> Result<Vec<EpisodeOutcome>> {
        let settings = self.current_settings();
        let seeds: Vec<u64> = (0..self.population.len())
            .map(|_| self.rng.next_u64())
            .collect();
        let play = |snake: &mut Snake, seed: u64| {
            let mut rng = SmallRng::seed_from_u64(seed);
            run_episode(snake, &settings, &mut rng)
        };
        if self.config.parallel {
            self.population
                .par_iter_mut()
                .zip(seeds)
                .map(|(snake, seed)| play(snake, seed))
                .collect()
        } else {
            self.population
                .iter_mut()
                .zip(seeds)
                .map(|(snake, seed)| play(snake, seed))
                .collect()
        }
    }

    /// Ranks the population by `fitness` and replaces it with the next generation.
    /// A length mismatch is rejected before anything changes.
    pub fn advance_generation(&mut self, fitness: &[f32]) -> Result<GenerationRecord> {
        let n = self.population.len();
        if fitness.len() != n {
            return Err(SnakeError::invariant(format!(
                "got {} fitness values for a population of {n}",
                fitness.len()
            )));
        }

        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| fitness[b].total_cmp(&fitness[a]));
        let best_fitness = fitness[order[0]];
        let avg_fitness = fitness.iter().sum::<f32>() / n as f32;

        let next_generation = self.generation + 1;
        if self
            .best_ever
            .as_ref()
            .is_none_or(|best| best_fitness > best.fitness)
        {
            debug!(
                generation = next_generation,
                fitness = best_fitness,
                "new best-ever genome"
            );
            self.best_ever = Some(BestGenome {
                genome: self.population[order[0]].genome().clone(),
                fitness: best_fitness,
                generation: next_generation,
            });
        }

        let elite: Vec<&Genome> = order
            .iter()
            .take(self.config.elite_size)
            .map(|&i| self.population[i].genome())
            .collect();
        let grid = self.config.grid_size;
        let mut next: Vec<Snake> = Vec::with_capacity(n);
        next.extend(
            elite
                .iter()
                .take(elite.len() / 2)
                .map(|&g| Snake::new(g.clone(), grid)),
        );
        while next.len() < n {
            let parent = elite[self.rng.gen_range(0..elite.len())];
            next.push(Snake::new(
                parent.mutate(&self.config.mutation, &mut self.rng),
                grid,
            ));
        }

        self.population = next;
        self.generation = next_generation;
        let record = GenerationRecord {
            generation: next_generation,
            best_fitness,
            avg_fitness,
        };
        self.history.push(record);
        Ok(record)
    }

    /// One full generation: evaluate then advance.
    pub fn evolve(&mut self) -> Result<GenerationSummary> {
        let outcomes = self.evaluate_generation()?;
        let fitness: Vec<f32> = outcomes.iter().map(|o| o.fitness).collect();
        let best_length = outcomes.iter().map(|o| o.length).max().unwrap_or(0);
        let victory = outcomes.iter().any(|o| o.end == EpisodeEnd::Victory);
        let record = self.advance_generation(&fitness)?;
        Ok(GenerationSummary {
            record,
            best_length,
            victory,
        })
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            generation: self.generation,
            best: self.best_ever.clone(),
        }
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn latest(&self) -> Option<&GenerationRecord> {
        self.history.last()
    }

    pub fn best_ever(&self) -> Option<&BestGenome> {
        self.best_ever.as_ref()
    }

    pub fn history(&self) -> &[GenerationRecord] {
        &self.history
    }

    pub fn population(&self) -> &[Snake] {
        &self.population
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    pub fn shape(&self) -> &NetworkShape {
        &self.shape
    }
}
