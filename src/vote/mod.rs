/// Voting module
///
/// Redis sorted-set ledger of per-user votes, post scores and the time,
/// score and community indexes used for ordered listings.

mod ledger;

#[cfg(test)]
mod tests;

pub use ledger::VoteLedger;
