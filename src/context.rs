//! Process-level run state handed to whoever needs it: the optional store and
//! session, the stop flag observed between generations, and the checkpoint
//! published after each one.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::codec;
use crate::error::Result;
use crate::evolution::{Checkpoint, Evolution, GenerationRecord};
use crate::genome::{Genome, NetworkShape};
use crate::storage::{GenomeStore, SessionId, SqliteStore, StorageResult};

/// The best genome is written at least this often, improved or not.
const SAVE_EVERY: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunEnd {
    Interrupted,
    Victory,
    GenerationLimit,
}

pub struct RunContext {
    store: Option<SqliteStore>,
    session: Option<SessionId>,
    stop: Arc<AtomicBool>,
    checkpoint: Arc<RwLock<Option<Checkpoint>>>,
    last_saved_fitness: Option<f32>,
}

impl RunContext {
    /// A context with nothing to persist to.
    pub fn detached() -> Self {
        Self {
            store: None,
            session: None,
            stop: Arc::new(AtomicBool::new(false)),
            checkpoint: Arc::new(RwLock::new(None)),
            last_saved_fitness: None,
        }
    }

    pub fn with_store(store: SqliteStore, session: SessionId) -> Self {
        Self {
            store: Some(store),
            session: Some(session),
            ..Self::detached()
        }
    }

    /// Reattaches to a stored session, returning the context and the last
    /// generation already recorded for it.
    pub fn continue_session(store: SqliteStore, session: SessionId) -> Result<(Self, u32)> {
        let done = store.last_generation(session)?;
        Ok((Self::with_store(store, session), done))
    }

    pub fn store(&self) -> Option<&SqliteStore> {
        self.store.as_ref()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn checkpoint_slot(&self) -> Arc<RwLock<Option<Checkpoint>>> {
        Arc::clone(&self.checkpoint)
    }

    pub fn should_stop(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Last checkpoint published by [`RunContext::record_generation`].
    pub fn published(&self) -> Option<Checkpoint> {
        match self.checkpoint.read() {
            Ok(slot) => slot.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn publish(&self, checkpoint: Checkpoint) {
        match self.checkpoint.write() {
            Ok(mut slot) => *slot = Some(checkpoint),
            Err(poisoned) => *poisoned.into_inner() = Some(checkpoint),
        }
    }

    /// Decodes the best stored genome of `session`, or of every session when
    /// `None`. A blob that fails to decode is replaced with a random genome.
    pub fn stored_genome<R: Rng>(
        &self,
        session: Option<SessionId>,
        shape: &NetworkShape,
        rng: &mut R,
    ) -> Result<Option<Genome>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let stored = match session {
            Some(id) => store.load_best_genome(id)?,
            None => store.best_overall()?,
        };
        Ok(stored.map(|s| {
            info!(
                session = s.session,
                generation = s.generation,
                fitness = s.fitness,
                "loaded stored genome"
            );
            codec::load_or_random(&s.bytes, shape, rng)
        }))
    }

    /// Publishes the checkpoint and persists the generation. Storage failures are
    /// logged and do not stop the run.
    pub fn record_generation(&mut self, evolution: &Evolution, record: &GenerationRecord) {
        self.publish(evolution.checkpoint());
        if let Err(e) = self.persist_generation(evolution, record) {
            warn!(generation = record.generation, error = %e, "failed to persist generation");
        }
    }

    fn persist_generation(
        &mut self,
        evolution: &Evolution,
        record: &GenerationRecord,
    ) -> StorageResult<()> {
        let (Some(store), Some(session)) = (&self.store, self.session) else {
            return Ok(());
        };
        store.save_generation(
            session,
            record.generation,
            record.best_fitness,
            record.avg_fitness,
        )?;
        if let Some(best) = evolution.best_ever() {
            let improved = self.last_saved_fitness.is_none_or(|f| best.fitness > f);
            if improved || record.generation % SAVE_EVERY == 0 {
                store.save_best_genome(session, best.generation, best.fitness, &best.genome)?;
                self.last_saved_fitness = Some(best.fitness);
            }
        }
        Ok(())
    }

    /// Writes the final best genome and session totals.
    pub fn finalize(&mut self, evolution: &Evolution) -> Result<()> {
        let checkpoint = evolution.checkpoint();
        self.publish(checkpoint.clone());
        let (Some(store), Some(session)) = (&self.store, self.session) else {
            return Ok(());
        };
        if let Some(best) = &checkpoint.best {
            if self.last_saved_fitness != Some(best.fitness) {
                store.save_best_genome(session, best.generation, best.fitness, &best.genome)?;
                self.last_saved_fitness = Some(best.fitness);
            }
        }
        store.update_session(session, checkpoint.generation, checkpoint.best_fitness())?;
        info!(
            session,
            generations = checkpoint.generation,
            best_fitness = checkpoint.best_fitness(),
            "session saved"
        );
        Ok(())
    }

    /// Evolves until a stop is requested, a snake fills the grid, or
    /// `max_generations` more generations have run.
    pub fn run(
        &mut self,
        evolution: &mut Evolution,
        max_generations: Option<u32>,
    ) -> Result<RunEnd> {
        let mut completed = 0u32;
        loop {
            if self.should_stop() {
                info!(generation = evolution.generation(), "stop requested");
                return Ok(RunEnd::Interrupted);
            }
            if max_generations.is_some_and(|max| completed >= max) {
                return Ok(RunEnd::GenerationLimit);
            }

            let summary = evolution.evolve()?;
            completed += 1;
            let best_ever = evolution.best_ever().map_or(0.0, |b| b.fitness);
            info!(
                generation = summary.record.generation,
                best = summary.record.best_fitness,
                avg = summary.record.avg_fitness,
                best_ever,
                length = summary.best_length,
                "generation complete"
            );
            self.record_generation(evolution, &summary.record);

            if summary.victory {
                info!(generation = summary.record.generation, "a snake filled the grid");
                return Ok(RunEnd::Victory);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvolutionConfig;

    fn evolution() -> Evolution {
        let mut config = EvolutionConfig {
            population_size: 6,
            elite_size: 2,
            grid_size: 8,
            max_steps: 40,
            seed: Some(5),
            ..Default::default()
        };
        config.network.hidden_layers = vec![4];
        Evolution::new(config).unwrap()
    }

    #[test]
    fn stop_before_start_runs_nothing() {
        let mut ctx = RunContext::detached();
        let mut evo = evolution();
        ctx.stop_flag().store(true, Ordering::SeqCst);
        assert_eq!(ctx.run(&mut evo, None).unwrap(), RunEnd::Interrupted);
        assert_eq!(evo.generation(), 0);
        assert!(ctx.published().is_none());
    }

    #[test]
    fn generation_limit_publishes_checkpoints() {
        let mut ctx = RunContext::detached();
        let slot = ctx.checkpoint_slot();
        let mut evo = evolution();
        assert_eq!(ctx.run(&mut evo, Some(2)).unwrap(), RunEnd::GenerationLimit);
        let published = slot.read().unwrap().clone().unwrap();
        assert_eq!(published.generation, 2);
        assert_eq!(published, evo.checkpoint());
    }

    #[test]
    fn detached_finalize_is_a_no_op() {
        let mut ctx = RunContext::detached();
        let evo = evolution();
        ctx.finalize(&evo).unwrap();
        assert!(ctx.stored_genome(None, evo.shape(), &mut rand::thread_rng()).unwrap().is_none());
    }

    #[test]
    fn stored_run_writes_history_and_best() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut evo = evolution();
        let session = store.create_session(evo.config(), None).unwrap();
        let mut ctx = RunContext::with_store(store, session);

        ctx.run(&mut evo, Some(3)).unwrap();
        ctx.finalize(&evo).unwrap();

        let store = ctx.store().unwrap();
        assert_eq!(store.generation_history(session).unwrap().len(), 3);
        let best = store.load_best_genome(session).unwrap().unwrap();
        assert_eq!(best.fitness, evo.best_ever().unwrap().fitness);
        let summary = &store.sessions(1).unwrap()[0];
        assert_eq!(summary.total_generations, 3);
        assert!(summary.ended_at.is_some());

        let genome = ctx
            .stored_genome(Some(session), evo.shape(), &mut rand::thread_rng())
            .unwrap()
            .unwrap();
        assert_eq!(genome, evo.best_ever().unwrap().genome);
    }
}
