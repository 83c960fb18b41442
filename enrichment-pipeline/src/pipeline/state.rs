use state_machines::state_machine;

state_machine! {
    name: EnrichmentMachine,
    state: EnrichmentState,
    initial: Ready,
    states: [Ready, EntitiesExtracted, GraphLinked, FactsWritten, Summarized, Persisted, Failed],
    events {
        extract { transition: { from: Ready, to: EntitiesExtracted } }
        link { transition: { from: EntitiesExtracted, to: GraphLinked } }
        relate { transition: { from: GraphLinked, to: FactsWritten } }
        summarize { transition: { from: FactsWritten, to: Summarized } }
        persist { transition: { from: Summarized, to: Persisted } }
        abort {
            transition: { from: Ready, to: Failed }
            transition: { from: EntitiesExtracted, to: Failed }
            transition: { from: GraphLinked, to: Failed }
            transition: { from: FactsWritten, to: Failed }
            transition: { from: Summarized, to: Failed }
            transition: { from: Persisted, to: Failed }
        }
    }
}

pub fn ready() -> EnrichmentMachine<(), Ready> {
    EnrichmentMachine::new(())
}
