use crate::domain::deposit::{Deposit, DepositStatus};
use crate::error::Result;
use rust_decimal::Decimal;
use serde::Serialize;
use std::io::Write;
use uuid::Uuid;

#[derive(Serialize)]
struct DepositRow<'a> {
    reference: &'a str,
    user: Uuid,
    status: DepositStatus,
    amount: Decimal,
    destination_amount: Option<Decimal>,
    provider_tx_id: Option<&'a str>,
}

/// Writes the final state of deposits as CSV.
pub struct DepositWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> DepositWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes one row per deposit, in the order given, and flushes.
    pub fn write_deposits<'a, I>(&mut self, deposits: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a Deposit>,
    {
        for deposit in deposits {
            self.writer.serialize(DepositRow {
                reference: &deposit.reference,
                user: deposit.user_id,
                status: deposit.status,
                amount: deposit.amount.value(),
                destination_amount: deposit.destination_amount,
                provider_tx_id: deposit.provider_tx_id.as_deref(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::money::Amount;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    #[test]
    fn test_writer_output() {
        let mut deposit = Deposit::new(
            Uuid::nil(),
            Uuid::new_v4(),
            "dep-1",
            Amount::new(dec!(100.50)).unwrap(),
            "USDC",
            Utc::now(),
        );
        deposit
            .mark_rail_initiated("tr_1".to_string(), Utc::now())
            .unwrap();
        deposit
            .mark_rail_completed(Some(dec!(100.00)), Utc::now())
            .unwrap();

        let mut buf = Vec::new();
        DepositWriter::new(&mut buf)
            .write_deposits([&deposit])
            .unwrap();
        let output = String::from_utf8(buf).unwrap();

        assert_eq!(
            output,
            "reference,user,status,amount,destination_amount,provider_tx_id\n\
             dep-1,00000000-0000-0000-0000-000000000000,rail_completed,100.50,100.00,tr_1\n"
        );
    }

    #[test]
    fn test_writer_empty_optionals() {
        let deposit = Deposit::new(
            Uuid::nil(),
            Uuid::new_v4(),
            "dep-2",
            Amount::new(dec!(5)).unwrap(),
            "USDC",
            Utc::now(),
        );
        let mut buf = Vec::new();
        DepositWriter::new(&mut buf)
            .write_deposits([&deposit])
            .unwrap();
        let output = String::from_utf8(buf).unwrap();
        assert!(output.ends_with("dep-2,00000000-0000-0000-0000-000000000000,created,5,,\n"));
    }
}
