//! Order execution: a pure escalation state machine and its async driver.

mod executor;
mod machine;

pub use executor::{
    execute_intent, ExecutionEngine, ExecutionSettings, FinalState, IntentOutcome, TradeRecord,
};
pub use machine::{ladder_price, Command, Event, Execution, MachineParams, OrderMachine, Phase};
