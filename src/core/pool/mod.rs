//! Persistent pool: the space header, the free-extent table, the
//! extent-vector table and the hint records, plus the transaction manager
//! guarding them.
//!
//! Tables may only be mutated inside a transaction. An aborted transaction,
//! or one that never commits because the process went away, leaves every
//! table exactly as it was when the transaction began.

pub mod btree;
pub mod image;
pub mod table;

use crate::error::{Result, VeaError};
use crate::extent::{ExtentVector, FreeExtent};
use crate::format::SpaceDf;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use table::TxTable;
use tracing::{debug, info, warn};

pub use btree::BTree;

/// Persistent locality record of one I/O stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HintRecord {
    pub offset: u64,
    pub seq: u64,
}

/// Everything the pool persists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolImage {
    pub df: SpaceDf,
    /// Free extents keyed by offset
    pub free: TxTable<FreeExtent>,
    /// Published extent vectors keyed by vector id
    pub vectors: TxTable<ExtentVector>,
    /// Hint records keyed by stream id
    pub hints: TxTable<HintRecord>,
}

impl PoolImage {
    fn commit(&mut self) {
        self.free.commit();
        self.vectors.commit();
        self.hints.commit();
    }

    fn rollback(&mut self, df: SpaceDf) -> Result<()> {
        self.free.rollback()?;
        self.vectors.rollback()?;
        self.hints.rollback()?;
        self.df = df;
        Ok(())
    }
}

#[derive(Debug)]
enum Backing {
    Memory,
    File(PathBuf),
}

#[derive(Debug)]
struct TxState {
    /// Space header as of tx_begin
    df: SpaceDf,
}

/// Backing store of one allocator space
#[derive(Debug)]
pub struct Pool {
    image: PoolImage,
    backing: Backing,
    tx: Option<TxState>,
    generation: u64,
}

impl Pool {
    /// Create an unformatted pool that lives only in memory
    pub fn memory() -> Self {
        Pool {
            image: PoolImage::default(),
            backing: Backing::Memory,
            tx: None,
            generation: 0,
        }
    }

    /// Create a new unformatted pool image file
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(VeaError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("pool image {} already exists", path.display()),
            )));
        }

        let image = PoolImage::default();
        image::save_image(&path, &image, 0)?;
        info!("Created pool image {}", path.display());

        Ok(Pool {
            image,
            backing: Backing::File(path),
            tx: None,
            generation: 0,
        })
    }

    /// Open an existing pool image file
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (image, generation) = image::load_image(&path)?;
        info!(
            "Opened pool image {} at generation {}",
            path.display(),
            generation
        );

        Ok(Pool {
            image,
            backing: Backing::File(path),
            tx: None,
            generation,
        })
    }

    /// Release the pool, aborting any transaction still in flight
    pub fn close(mut self) -> Result<()> {
        if self.in_tx() {
            warn!("Closing pool with an open transaction, aborting it");
            self.tx_abort()?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory => None,
            Backing::File(path) => Some(path),
        }
    }

    /// Number of committed transactions
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn in_tx(&self) -> bool {
        self.tx.is_some()
    }

    pub fn tx_begin(&mut self) -> Result<()> {
        if self.tx.is_some() {
            return Err(VeaError::TransactionActive);
        }
        self.tx = Some(TxState { df: self.image.df });
        Ok(())
    }

    /// Make the transaction durable
    ///
    /// If the image cannot be written the transaction is rolled back and
    /// the write error returned.
    pub fn tx_commit(&mut self) -> Result<()> {
        let state = self.tx.take().ok_or(VeaError::NoTransaction)?;

        if let Backing::File(path) = &self.backing {
            if let Err(err) = image::save_image(path, &self.image, self.generation + 1) {
                warn!("Commit of generation {} failed: {}", self.generation + 1, err);
                self.image.rollback(state.df)?;
                return Err(err);
            }
        }

        self.image.commit();
        self.generation += 1;
        debug!("Committed generation {}", self.generation);
        Ok(())
    }

    pub fn tx_abort(&mut self) -> Result<()> {
        let state = self.tx.take().ok_or(VeaError::NoTransaction)?;
        self.image.rollback(state.df)?;
        debug!("Aborted transaction on generation {}", self.generation);
        Ok(())
    }

    /// Run `f` in a transaction, committing on success and aborting on error
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Pool) -> Result<T>,
    {
        self.tx_begin()?;
        match f(self) {
            Ok(value) => {
                self.tx_commit()?;
                Ok(value)
            }
            Err(err) => {
                self.tx_abort()?;
                Err(err)
            }
        }
    }

    fn require_tx(&self) -> Result<()> {
        if self.tx.is_none() {
            return Err(VeaError::NoTransaction);
        }
        Ok(())
    }

    pub fn df(&self) -> &SpaceDf {
        &self.image.df
    }

    pub fn set_df(&mut self, df: SpaceDf) -> Result<()> {
        self.require_tx()?;
        self.image.df = df;
        Ok(())
    }

    pub fn free_table(&self) -> &TxTable<FreeExtent> {
        &self.image.free
    }

    pub fn free_table_mut(&mut self) -> Result<&mut TxTable<FreeExtent>> {
        self.require_tx()?;
        Ok(&mut self.image.free)
    }

    pub fn vector_table(&self) -> &TxTable<ExtentVector> {
        &self.image.vectors
    }

    pub fn vector_table_mut(&mut self) -> Result<&mut TxTable<ExtentVector>> {
        self.require_tx()?;
        Ok(&mut self.image.vectors)
    }

    pub fn hint_table(&self) -> &TxTable<HintRecord> {
        &self.image.hints
    }

    pub fn hint_table_mut(&mut self) -> Result<&mut TxTable<HintRecord>> {
        self.require_tx()?;
        Ok(&mut self.image.hints)
    }

    /// Drop every table and reset the header, inside the open transaction
    pub(crate) fn clear(&mut self) -> Result<()> {
        self.require_tx()?;
        for (key, _) in self.image.free.entries()? {
            self.image.free.delete(key)?;
        }
        for (key, _) in self.image.vectors.entries()? {
            self.image.vectors.delete(key)?;
        }
        for (key, _) in self.image.hints.entries()? {
            self.image.hints.delete(key)?;
        }
        self.image.df = SpaceDf::default();
        Ok(())
    }
}
