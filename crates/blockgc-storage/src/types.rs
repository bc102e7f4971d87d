use blockgc_types::TxnId;

/// Extent of one container's delete log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TxnLogState {
    /// Smallest id still in the log (`None` if empty).
    pub first_txn_id: Option<TxnId>,
    /// Largest id still in the log (`None` if empty).
    pub last_txn_id: Option<TxnId>,
    /// Highest id ever appended, including truncated ones. 0 if none.
    pub issued_txn_id: TxnId,
}
