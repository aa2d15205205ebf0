pub mod deposit_writer;
pub mod instruction_reader;
