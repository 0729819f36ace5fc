#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MempoolError {
    #[error("tx already exists in cache")]
    TxInCache,
    #[error("tx too large. Max size is {max}, but got {got}")]
    TxTooLarge { max: usize, got: usize },
    #[error(
        "mempool is full: number of txs {num_txs} (max: {max_txs}), total txs bytes {txs_bytes} \
         (max: {max_txs_bytes})"
    )]
    MempoolIsFull {
        num_txs: usize,
        max_txs: usize,
        txs_bytes: u64,
        max_txs_bytes: u64,
    },
    #[error("tx rejected by the application (code {code}): {log}")]
    AppRejected { code: u32, log: String },
    #[error("tx failed pre-check: {0}")]
    PreCheck(String),
    #[error("tx wants {gas_wanted} gas, more than the maximum of {max_gas}")]
    PostCheck { gas_wanted: i64, max_gas: i64 },
    #[error("no free mempool peer ids, {0} are active")]
    TooManyPeers(usize),
    #[error("mempool wal: {0}")]
    Wal(String),
}
