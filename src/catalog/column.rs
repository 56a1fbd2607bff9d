// Copyright 2024 RisingLight Project Authors. Licensed under Apache-2.0.

use serde::{Deserialize, Serialize};

use super::CompressionMode;
use crate::types::{ColumnId, DataType, Oid};

/// Description of one column of the table being loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobColumn {
    id: ColumnId,
    name: String,
    oid: Oid,
    data_type: DataType,
    compression: CompressionMode,
    auto_increment: bool,
    /// Oid of the dictionary store, for dictionary-encoded character columns.
    dictionary_oid: Option<Oid>,
}

impl JobColumn {
    pub fn new(id: ColumnId, name: impl Into<String>, oid: Oid, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            oid,
            data_type,
            compression: CompressionMode::None,
            auto_increment: false,
            dictionary_oid: None,
        }
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }

    pub fn with_dictionary_oid(mut self, oid: Oid) -> Self {
        self.dictionary_oid = Some(oid);
        self
    }

    pub fn id(&self) -> ColumnId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Width in bytes of one value in the column's segment files.
    pub fn width(&self) -> u32 {
        self.data_type.width()
    }

    pub fn compression(&self) -> CompressionMode {
        self.compression
    }

    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    pub fn dictionary_oid(&self) -> Option<Oid> {
        self.dictionary_oid
    }
}
