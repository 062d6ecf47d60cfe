//! Genesis - seed parties, entity list and counters

use tracing::info;

use crate::core::{Config, Entity, Ledger, Result};
use crate::ledger::Stage;
use crate::registry::{ENTITY_LIST_KEY, EntityRegistry};
use crate::sequence::SequenceAllocator;

/// Write the configured parties and counters. Returns `false` without writing
/// when the ledger already carries an entity list.
pub fn seed(ledger: &dyn Ledger, config: &Config) -> Result<bool> {
    if ledger.get_state(ENTITY_LIST_KEY)?.is_some() {
        info!("ledger already seeded, genesis skipped");
        return Ok(false);
    }

    SequenceAllocator::seed(ledger, config.engine.counter_baseline)?;

    let registry = EntityRegistry::new(config.engine.instrument_history);
    let mut stage = Stage::new(ledger);
    for seed in &config.genesis.entities {
        let mut entity = Entity::new(&seed.id, &seed.name, seed.kind, seed.balance);
        entity.address = seed.address.clone();
        entity.credit_rating = seed.credit_rating.clone();
        registry.register(&mut stage, &entity)?;
    }
    // an empty seed list still marks the ledger as seeded
    if config.genesis.entities.is_empty() {
        stage.put_json(ENTITY_LIST_KEY, &Vec::<String>::new())?;
    }
    let writes = stage.commit(false)?;

    info!(
        entities = config.genesis.entities.len(),
        baseline = config.engine.counter_baseline,
        writes,
        "genesis complete"
    );
    Ok(true)
}
