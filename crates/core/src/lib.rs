pub mod account;
pub mod import_file;
pub mod money;
pub mod period;
pub mod records;
pub mod recurring;
pub mod rule;
pub mod transaction;

pub use account::{Account, AccountId, UserId};
pub use import_file::{
    DuplicatePolicy, FileFormat, ImportCounts, ImportFile, ImportStatus, NewImportFile, RawFields,
    RawTransactionRow,
};
pub use money::Money;
pub use period::DateRange;
pub use records::{ExpenseRecord, IncomeRecord};
pub use recurring::{Frequency, RecurringKey, RecurringPayment};
pub use rule::{CategoryRule, RuleType};
pub use transaction::{
    AnomalyFlag, Category, Direction, EntityLink, LinkOrigin, NormalizedTransaction,
    StoredTransaction, TransactionSource, UnifiedTransaction,
};
