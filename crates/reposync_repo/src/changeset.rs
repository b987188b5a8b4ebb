//! Changesets: ordered row-level diffs between two repository states.

use crate::error::{RepoError, RepoResult};
use crate::id::{Id64, RepositoryId};
use crate::records::{
    ClassName, CodeSpecProps, ContainerProps, EntityProps, FacetProps, RelationshipProps,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Operation recorded by a changeset row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeOp {
    /// The row was created.
    Inserted,
    /// The row was modified.
    Updated,
    /// The row was removed.
    Deleted,
}

/// The table a changeset row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TableKind {
    /// Entity table.
    Entity,
    /// Container table.
    Container,
    /// Relationship table.
    Relationship,
    /// Facet table.
    Facet,
    /// Code spec table.
    CodeSpec,
}

/// Full image of a row before or after a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowImage {
    /// Entity row.
    Entity(EntityProps),
    /// Container row.
    Container(ContainerProps),
    /// Relationship row.
    Relationship(RelationshipProps),
    /// Facet row.
    Facet(FacetProps),
    /// Code spec row.
    CodeSpec(CodeSpecProps),
}

impl RowImage {
    /// Identifier of the row.
    #[must_use]
    pub fn id(&self) -> Id64 {
        match self {
            RowImage::Entity(props) => props.id,
            RowImage::Container(props) => props.id,
            RowImage::Relationship(props) => props.id,
            RowImage::Facet(props) => props.id,
            RowImage::CodeSpec(props) => props.id,
        }
    }

    /// Class of the row, if the table is class-typed.
    #[must_use]
    pub fn class_name(&self) -> Option<&ClassName> {
        match self {
            RowImage::Entity(props) => Some(&props.class_name),
            RowImage::Container(props) => Some(&props.class_name),
            RowImage::Relationship(props) => Some(&props.class_name),
            RowImage::Facet(props) => Some(&props.class_name),
            RowImage::CodeSpec(_) => None,
        }
    }

    /// Table the row lives in.
    #[must_use]
    pub fn table(&self) -> TableKind {
        match self {
            RowImage::Entity(_) => TableKind::Entity,
            RowImage::Container(_) => TableKind::Container,
            RowImage::Relationship(_) => TableKind::Relationship,
            RowImage::Facet(_) => TableKind::Facet,
            RowImage::CodeSpec(_) => TableKind::CodeSpec,
        }
    }
}

/// One `(operation, old row, new row)` tuple.
///
/// `Inserted` rows carry only `new`, `Deleted` rows only `old`, `Updated`
/// rows both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetRow {
    /// Operation.
    pub op: ChangeOp,
    /// Row before the change.
    pub old: Option<RowImage>,
    /// Row after the change.
    pub new: Option<RowImage>,
}

impl ChangesetRow {
    /// Creates an insert row.
    #[must_use]
    pub fn inserted(new: RowImage) -> Self {
        Self {
            op: ChangeOp::Inserted,
            old: None,
            new: Some(new),
        }
    }

    /// Creates an update row.
    #[must_use]
    pub fn updated(old: RowImage, new: RowImage) -> Self {
        Self {
            op: ChangeOp::Updated,
            old: Some(old),
            new: Some(new),
        }
    }

    /// Creates a delete row.
    #[must_use]
    pub fn deleted(old: RowImage) -> Self {
        Self {
            op: ChangeOp::Deleted,
            old: Some(old),
            new: None,
        }
    }

    /// The most recent image of the row.
    #[must_use]
    pub fn current(&self) -> Option<&RowImage> {
        self.new.as_ref().or(self.old.as_ref())
    }

    /// Identifier of the changed row.
    #[must_use]
    pub fn id(&self) -> Id64 {
        self.current().map_or(Id64::INVALID, RowImage::id)
    }

    /// Table of the changed row.
    #[must_use]
    pub fn table(&self) -> Option<TableKind> {
        self.current().map(RowImage::table)
    }
}

/// An ordered set of row changes between two states of one repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    /// 1-based position in the repository's history.
    pub index: u64,
    /// Repository that produced the changeset.
    pub repository: RepositoryId,
    /// Free-form description.
    pub description: String,
    /// Rows in the order the changes were made.
    pub rows: Vec<ChangesetRow>,
}

impl Changeset {
    /// Creates an empty changeset.
    pub fn new(index: u64, repository: RepositoryId, description: impl Into<String>) -> Self {
        Self {
            index,
            repository,
            description: description.into(),
            rows: Vec::new(),
        }
    }

    /// Returns the rows touching `table`.
    pub fn rows_for(&self, table: TableKind) -> impl Iterator<Item = &ChangesetRow> {
        self.rows
            .iter()
            .filter(move |row| row.table() == Some(table))
    }

    /// Writes the changeset to `path` as CBOR.
    pub fn write_to(&self, path: &Path) -> RepoResult<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        ciborium::into_writer(self, &mut writer).map_err(|e| RepoError::codec(e.to_string()))?;
        writer.flush()?;
        Ok(())
    }

    /// Reads a changeset written by [`Changeset::write_to`].
    pub fn read_from(path: &Path) -> RepoResult<Self> {
        let file = File::open(path)?;
        ciborium::from_reader(BufReader::new(file)).map_err(|e| RepoError::codec(e.to_string()))
    }
}

/// Inclusive range of changeset indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChangesetRange {
    /// First index (1-based).
    pub first: u64,
    /// Last index, inclusive.
    pub last: u64,
}

impl ChangesetRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(first: u64, last: u64) -> Self {
        Self { first, last }
    }

    /// A range holding exactly one changeset.
    #[must_use]
    pub const fn single(index: u64) -> Self {
        Self::new(index, index)
    }

    /// Returns true if the range holds no changesets.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.first == 0 || self.first > self.last
    }

    /// Number of changesets in the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.last - self.first + 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::FacetKind;
    use tempfile::TempDir;

    fn sample() -> Changeset {
        let mut entity = EntityProps::new(ClassName::new("Plant:Pump"), Id64::ROOT_CONTAINER);
        entity.id = Id64::new(0x20);
        let mut facet = FacetProps::new(
            ClassName::new("Plant:Inspection"),
            FacetKind::Multi,
            Id64::new(0x20),
        );
        facet.id = Id64::new(0x21);

        let mut changeset = Changeset::new(3, RepositoryId::new(), "pumps");
        changeset.rows.push(ChangesetRow::inserted(RowImage::Entity(entity.clone())));
        changeset.rows.push(ChangesetRow::deleted(RowImage::Facet(facet)));
        changeset
    }

    #[test]
    fn row_accessors() {
        let changeset = sample();
        let row = &changeset.rows[1];
        assert_eq!(row.op, ChangeOp::Deleted);
        assert_eq!(row.id(), Id64::new(0x21));
        assert_eq!(row.table(), Some(TableKind::Facet));
        assert_eq!(changeset.rows_for(TableKind::Entity).count(), 1);
    }

    #[test]
    fn file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cs-3.cbor");
        let changeset = sample();

        changeset.write_to(&path).unwrap();
        let read = Changeset::read_from(&path).unwrap();
        assert_eq!(read, changeset);
    }

    #[test]
    fn read_garbage_fails() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.cbor");
        std::fs::write(&path, b"\xff\x00garbage").unwrap();
        assert!(matches!(
            Changeset::read_from(&path),
            Err(RepoError::ChangesetCodec(_))
        ));
    }

    #[test]
    fn range_len() {
        assert_eq!(ChangesetRange::new(2, 4).len(), 3);
        assert_eq!(ChangesetRange::single(5).len(), 1);
        assert!(ChangesetRange::new(4, 2).is_empty());
        assert!(ChangesetRange::new(0, 2).is_empty());
    }
}
