use crate::domain::money::Amount;
use crate::error::{RailError, Result};
use serde::Deserialize;
use std::io::Read;
use uuid::Uuid;

/// How the sandbox rail settles the transfer created for a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettlementOutcome {
    Completed,
    Failed,
    /// Left in flight; no webhook is delivered.
    Pending,
}

/// One row of a replay file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DepositInstruction {
    pub user: Uuid,
    pub kyc_status: String,
    pub rail_account: String,
    pub brokerage_account: String,
    pub reference: String,
    pub amount: Amount,
    pub outcome: SettlementOutcome,
}

/// Reads deposit instructions from a CSV source.
///
/// Wraps `csv::Reader` with whitespace trimming and yields one `Result` per
/// row, so a malformed row does not stop the stream.
pub struct InstructionReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> InstructionReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily deserializes instructions in file order.
    pub fn instructions(self) -> impl Iterator<Item = Result<DepositInstruction>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(RailError::from))
    }
}
