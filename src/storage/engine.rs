//! Binary IO for the schema catalog (`.dbf`), record heap (`.dat`) and
//! index files (`.idx`)
//!
//! Both catalog and heap are sequences of blocks introduced by a `~`
//! separator byte. Records are written once and then only overwritten
//! in place with images of identical length; length changes go through
//! the logical DELETE + append-INSERT path in the DML layer.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use crate::catalog::{Field, ForeignKeyDef, IndexDef, Record, ReferentialAction, TableSchema};
use crate::error::{Error, Result};
use crate::storage::codec::{self, Cursor};
use crate::storage::paths::DbPaths;

/// Block separator byte in `.dbf` and `.dat`.
pub const TABLE_SEP: u8 = b'~';

/// Stateless accessor for the on-disk formats. Methods take explicit
/// paths so recovery and services can address any database.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageEngine;

fn read_file_or_empty(path: &Path) -> Result<Vec<u8>> {
    match std::fs::read(path) {
        Ok(data) => Ok(data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}

impl StorageEngine {
    pub fn new() -> Self {
        StorageEngine
    }

    // ========== Database lifecycle ==========

    /// Create the directory and empty files for a new database.
    pub fn create_database(&self, root: &Path, db: &str) -> Result<()> {
        let paths = DbPaths::new(root, db);
        if paths.exists() {
            return Err(Error::DatabaseAlreadyExists(db.to_string()));
        }
        paths.ensure_dirs()?;
        std::fs::write(&paths.dbf, [])?;
        std::fs::write(&paths.dat, [])?;
        std::fs::write(&paths.wal, [])?;
        Ok(())
    }

    /// Remove a database directory and everything under it.
    pub fn drop_database(&self, root: &Path, db: &str) -> Result<()> {
        let paths = DbPaths::new(root, db);
        if !paths.exists() {
            return Err(Error::DatabaseNotFound(db.to_string()));
        }
        std::fs::remove_dir_all(&paths.dir)?;
        Ok(())
    }

    // ========== Schema catalog ==========

    /// Read every table block from the catalog. A missing file means
    /// "no tables".
    pub fn load_schemas(&self, dbf: &Path) -> Result<Vec<TableSchema>> {
        let data = read_file_or_empty(dbf)?;
        let mut cur = Cursor::new(&data);
        let mut schemas = Vec::new();
        while !cur.is_at_end() {
            let sep = cur.byte()?;
            if sep != TABLE_SEP {
                return Err(Error::Corruption {
                    file: file_name(dbf),
                    detail: format!("bad table separator byte 0x{sep:02x}"),
                });
            }
            schemas.push(Self::decode_schema(&mut cur, dbf)?);
        }
        Ok(schemas)
    }

    /// Load a single schema by table name.
    pub fn load_schema(&self, dbf: &Path, table: &str) -> Result<TableSchema> {
        self.load_schemas(dbf)?
            .into_iter()
            .find(|s| s.name.eq_ignore_ascii_case(table))
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    /// Overwrite the catalog with the given schema list.
    pub fn save_schemas(&self, dbf: &Path, schemas: &[TableSchema]) -> Result<()> {
        let mut out = Vec::new();
        for schema in schemas {
            out.push(TABLE_SEP);
            Self::encode_schema(&mut out, schema);
        }
        std::fs::write(dbf, out)?;
        Ok(())
    }

    /// Append one schema, rewriting the whole catalog.
    pub fn append_schema(&self, dbf: &Path, schema: &TableSchema) -> Result<()> {
        let mut schemas = self.load_schemas(dbf).unwrap_or_default();
        schemas.push(schema.clone());
        self.save_schemas(dbf, &schemas)
    }

    fn encode_schema(out: &mut Vec<u8>, schema: &TableSchema) {
        codec::put_string(out, &schema.name);
        codec::put_u32(out, schema.fields.len() as u32);
        for f in &schema.fields {
            codec::put_string(out, &f.name);
            codec::put_string(out, &f.type_name);
            codec::put_u32(out, f.size);
            out.push(f.is_key as u8);
            out.push(f.nullable as u8);
            out.push(f.valid as u8);
        }
        codec::put_u32(out, schema.indexes.len() as u32);
        for idx in &schema.indexes {
            codec::put_string(out, &idx.name);
            codec::put_string(out, &idx.column);
            out.push(idx.unique as u8);
        }
        codec::put_u32(out, schema.foreign_keys.len() as u32);
        for fk in &schema.foreign_keys {
            codec::put_string(out, &fk.name);
            codec::put_u32(out, fk.columns.len() as u32);
            for c in &fk.columns {
                codec::put_string(out, c);
            }
            codec::put_string(out, &fk.ref_table);
            codec::put_u32(out, fk.ref_columns.len() as u32);
            for c in &fk.ref_columns {
                codec::put_string(out, c);
            }
            out.push(fk.on_delete.as_byte());
            out.push(fk.on_update.as_byte());
        }
        out.push(schema.is_view as u8);
        codec::put_string(out, &schema.view_sql);
    }

    fn decode_schema(cur: &mut Cursor<'_>, dbf: &Path) -> Result<TableSchema> {
        let corrupt = |detail: String| Error::Corruption {
            file: file_name(dbf),
            detail,
        };
        let mut schema = TableSchema::new(cur.string()?);
        let field_count = cur.u32()?;
        for _ in 0..field_count {
            let name = cur.string()?;
            let type_name = cur.string()?;
            let size = cur.u32()?;
            let is_key = cur.byte()? != 0;
            let nullable = cur.byte()? != 0;
            let valid = cur.byte()? != 0;
            schema.fields.push(Field {
                name,
                type_name,
                size,
                is_key,
                nullable,
                valid,
            });
        }
        let index_count = cur.u32()?;
        for _ in 0..index_count {
            let name = cur.string()?;
            let column = cur.string()?;
            let unique = cur.byte()? != 0;
            schema.indexes.push(IndexDef {
                name,
                column,
                unique,
            });
        }
        let fk_count = cur.u32()?;
        for _ in 0..fk_count {
            let name = cur.string()?;
            let column_count = cur.u32()? as usize;
            if column_count > 4096 {
                return Err(corrupt(format!(
                    "implausible foreign-key column count {column_count}"
                )));
            }
            let mut columns = Vec::with_capacity(column_count);
            for _ in 0..column_count {
                columns.push(cur.string()?);
            }
            let ref_table = cur.string()?;
            let ref_count = cur.u32()? as usize;
            let mut ref_columns = Vec::with_capacity(ref_count.min(4096));
            for _ in 0..ref_count {
                ref_columns.push(cur.string()?);
            }
            let on_delete = ReferentialAction::from_byte(cur.byte()?);
            let on_update = ReferentialAction::from_byte(cur.byte()?);
            schema.foreign_keys.push(ForeignKeyDef {
                name,
                columns,
                ref_table,
                ref_columns,
                on_delete,
                on_update,
            });
        }
        schema.is_view = cur.byte()? != 0;
        schema.view_sql = cur.string()?;
        Ok(schema)
    }

    // ========== Record heap ==========

    /// Byte image of a record: valid byte + length-prefixed values.
    pub fn serialize_record(&self, schema: &TableSchema, record: &Record) -> Result<Vec<u8>> {
        if record.values.len() != schema.fields.len() {
            return Err(Error::FieldCountMismatch(schema.name.clone()));
        }
        let mut out = Vec::new();
        out.push(record.valid as u8);
        for v in &record.values {
            codec::put_string(&mut out, v);
        }
        Ok(out)
    }

    /// Serialize for an in-place overwrite at `offset`. Fails loudly
    /// when the new image would not occupy exactly `expected_len`
    /// bytes, so callers fall back to DELETE + INSERT.
    pub fn serialize_fixed_length(
        &self,
        schema: &TableSchema,
        record: &Record,
        expected_len: usize,
        offset: u64,
    ) -> Result<Vec<u8>> {
        let bytes = self.serialize_record(schema, record)?;
        if bytes.len() != expected_len {
            return Err(Error::RecordLengthChanged {
                offset,
                expected: expected_len,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }

    fn block_header(schema: &TableSchema, record_count: u32) -> Vec<u8> {
        let mut header = vec![TABLE_SEP];
        codec::put_string(&mut header, &schema.name);
        codec::put_u32(&mut header, record_count);
        codec::put_u32(&mut header, schema.fields.len() as u32);
        header
    }

    /// Append a single-record block and return the record's RID offset
    /// (the position of its valid byte).
    pub fn append_record(&self, dat: &Path, schema: &TableSchema, record: &Record) -> Result<u64> {
        let bytes = self.serialize_record(schema, record)?;
        let header = Self::block_header(schema, 1);
        let mut file = OpenOptions::new().create(true).append(true).open(dat)?;
        let start = file.seek(SeekFrom::End(0))?;
        file.write_all(&header)?;
        file.write_all(&bytes)?;
        Ok(start + header.len() as u64)
    }

    /// Append several records as one block. Offsets are not reported;
    /// WAL-logged inserts append one block per record instead.
    pub fn append_records(
        &self,
        dat: &Path,
        schema: &TableSchema,
        records: &[Record],
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut out = Self::block_header(schema, records.len() as u32);
        for record in records {
            out.extend_from_slice(&self.serialize_record(schema, record)?);
        }
        let mut file = OpenOptions::new().create(true).append(true).open(dat)?;
        file.write_all(&out)?;
        Ok(())
    }

    /// Predict the RID the next single-record append will take, so the
    /// WAL record can be written ahead of the data change.
    pub fn compute_append_record_offset(&self, dat: &Path, schema: &TableSchema) -> Result<u64> {
        let len = match std::fs::metadata(dat) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(len + Self::block_header(schema, 1).len() as u64)
    }

    /// Write a single-record block whose record starts at
    /// `record_offset`; used by recovery redo to reproduce an append.
    pub fn write_insert_block_at(
        &self,
        dat: &Path,
        schema: &TableSchema,
        record_offset: u64,
        record_bytes: &[u8],
    ) -> Result<()> {
        let header = Self::block_header(schema, 1);
        let header_offset = record_offset
            .checked_sub(header.len() as u64)
            .ok_or_else(|| Error::Corruption {
                file: file_name(dat),
                detail: format!("insert offset {record_offset} precedes its block header"),
            })?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dat)?;
        let end = file.seek(SeekFrom::End(0))?;
        if end < header_offset {
            // Pad a hole left by a lost later append.
            file.write_all(&vec![0u8; (header_offset - end) as usize])?;
        }
        file.seek(SeekFrom::Start(header_offset))?;
        file.write_all(&header)?;
        file.write_all(record_bytes)?;
        Ok(())
    }

    /// All records of a table, tombstones included, in file order.
    pub fn read_records(&self, dat: &Path, schema: &TableSchema) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        self.scan_blocks(dat, schema, |_, record| {
            out.push(record);
            Ok(())
        })?;
        Ok(out)
    }

    /// Live records of a table with their RID offsets.
    pub fn read_records_with_offsets(
        &self,
        dat: &Path,
        schema: &TableSchema,
    ) -> Result<Vec<(u64, Record)>> {
        let mut out = Vec::new();
        self.scan_blocks(dat, schema, |offset, record| {
            if record.valid {
                out.push((offset, record));
            }
            Ok(())
        })?;
        Ok(out)
    }

    fn scan_blocks<F>(&self, dat: &Path, schema: &TableSchema, mut visit: F) -> Result<()>
    where
        F: FnMut(u64, Record) -> Result<()>,
    {
        let data = read_file_or_empty(dat)?;
        let mut cur = Cursor::new(&data);
        while !cur.is_at_end() {
            let sep = cur.byte()?;
            if sep != TABLE_SEP {
                return Err(Error::Corruption {
                    file: file_name(dat),
                    detail: format!("bad block separator byte 0x{sep:02x}"),
                });
            }
            let table = cur.string()?;
            let record_count = cur.u32()?;
            let field_count = cur.u32()? as usize;
            let wanted = table.eq_ignore_ascii_case(&schema.name);
            for _ in 0..record_count {
                let offset = cur.position();
                let valid = cur.byte()? != 0;
                if wanted {
                    let mut values = Vec::with_capacity(field_count);
                    for _ in 0..field_count {
                        values.push(cur.string()?);
                    }
                    visit(offset, Record { valid, values })?;
                } else {
                    for _ in 0..field_count {
                        cur.skip_string()?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Read one record at a known offset.
    pub fn read_record_at(&self, dat: &Path, schema: &TableSchema, offset: u64) -> Result<Record> {
        let data = read_file_or_empty(dat)?;
        if offset as usize >= data.len() {
            return Err(Error::Corruption {
                file: file_name(dat),
                detail: format!("record offset {offset} beyond end of file"),
            });
        }
        let mut cur = Cursor::new(&data[offset as usize..]);
        let valid = cur.byte()? != 0;
        let mut values = Vec::with_capacity(schema.fields.len());
        for _ in 0..schema.fields.len() {
            values.push(cur.string()?);
        }
        Ok(Record { valid, values })
    }

    /// Raw bytes of a record at a known offset (valid byte + fields).
    pub fn read_record_bytes_at(
        &self,
        dat: &Path,
        schema: &TableSchema,
        offset: u64,
    ) -> Result<Vec<u8>> {
        let record = self.read_record_at(dat, schema, offset)?;
        self.serialize_record(schema, &record)
    }

    /// In-place overwrite at a known offset; the caller guarantees the
    /// byte length matches what is already there.
    pub fn write_record_bytes_at(&self, dat: &Path, offset: u64, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(dat)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// Rewrite the heap replacing one table's records and preserving
    /// every other table's blocks.
    pub fn save_records(
        &self,
        dat: &Path,
        dbf: &Path,
        schema: &TableSchema,
        records: &[Record],
    ) -> Result<()> {
        let schemas = self.load_schemas(dbf).unwrap_or_default();
        let mut entries: Vec<(TableSchema, Vec<Record>)> = Vec::new();
        let mut replaced = false;
        for s in schemas {
            if s.is_view {
                continue;
            }
            if s.name.eq_ignore_ascii_case(&schema.name) {
                entries.push((schema.clone(), records.to_vec()));
                replaced = true;
            } else {
                let existing = self.read_records(dat, &s).unwrap_or_default();
                entries.push((s, existing));
            }
        }
        if !replaced {
            entries.push((schema.clone(), records.to_vec()));
        }
        self.rewrite_heap(dat, &entries)
    }

    /// Overwrite the heap from in-memory table images.
    pub fn rewrite_heap(&self, dat: &Path, entries: &[(TableSchema, Vec<Record>)]) -> Result<()> {
        let mut out = Vec::new();
        for (schema, records) in entries {
            out.extend_from_slice(&Self::block_header(schema, records.len() as u32));
            for record in records {
                let mut values = record.values.clone();
                values.resize(schema.fields.len(), String::new());
                let fitted = Record {
                    valid: record.valid,
                    values,
                };
                out.extend_from_slice(&self.serialize_record(schema, &fitted)?);
            }
        }
        std::fs::write(dat, out)?;
        Ok(())
    }

    // ========== Index files ==========

    /// Load an index file: sorted (key, RID) pairs. Missing file reads
    /// as an empty index.
    pub fn load_index(&self, path: &Path) -> Result<BTreeMap<String, u64>> {
        let data = read_file_or_empty(path)?;
        let mut cur = Cursor::new(&data);
        let mut index = BTreeMap::new();
        while !cur.is_at_end() {
            let key = cur.string()?;
            let offset = cur.u32()? as u64;
            index.insert(key, offset);
        }
        Ok(index)
    }

    /// Persist an index as (length-prefixed key, u32 offset) pairs in
    /// key order.
    pub fn save_index(&self, path: &Path, index: &BTreeMap<String, u64>) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = Vec::new();
        for (key, offset) in index {
            codec::put_string(&mut out, key);
            codec::put_u32(&mut out, *offset as u32);
        }
        std::fs::write(path, out)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn users_schema() -> TableSchema {
        let mut schema = TableSchema::new("users");
        schema.fields.push(Field::new("id", "int").key());
        schema.fields.push(Field::new("name", "char[8]"));
        schema.indexes.push(IndexDef {
            name: "PRIMARY".to_string(),
            column: "id".to_string(),
            unique: true,
        });
        schema
    }

    fn orders_schema() -> TableSchema {
        let mut schema = TableSchema::new("orders");
        schema.fields.push(Field::new("id", "int").key());
        schema.fields.push(Field::new("user_id", "int"));
        schema.foreign_keys.push(ForeignKeyDef {
            name: "fk_orders_users_1".to_string(),
            columns: vec!["user_id".to_string()],
            ref_table: "users".to_string(),
            ref_columns: vec!["id".to_string()],
            on_delete: ReferentialAction::Cascade,
            on_update: ReferentialAction::Restrict,
        });
        schema
    }

    #[test]
    fn test_schema_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dbf = dir.path().join("db.dbf");
        let engine = StorageEngine::new();

        let schemas = vec![users_schema(), orders_schema()];
        engine.save_schemas(&dbf, &schemas).unwrap();
        let loaded = engine.load_schemas(&dbf).unwrap();
        assert_eq!(loaded, schemas);
    }

    #[test]
    fn test_missing_dbf_means_no_tables() {
        let engine = StorageEngine::new();
        let schemas = engine.load_schemas(Path::new("/nope/missing.dbf")).unwrap();
        assert!(schemas.is_empty());
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let dat = dir.path().join("db.dat");
        let engine = StorageEngine::new();
        let schema = users_schema();

        let off1 = engine
            .append_record(&dat, &schema, &Record::from_strs(&["1", "alice"]))
            .unwrap();
        let off2 = engine
            .append_record(&dat, &schema, &Record::from_strs(&["2", "bob"]))
            .unwrap();
        assert!(off2 > off1);

        let rows = engine.read_records_with_offsets(&dat, &schema).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, off1);
        assert_eq!(rows[0].1.values, vec!["1", "alice"]);
        assert_eq!(rows[1].0, off2);

        let direct = engine.read_record_at(&dat, &schema, off2).unwrap();
        assert_eq!(direct.values, vec!["2", "bob"]);
    }

    #[test]
    fn test_scan_skips_unrelated_tables() {
        let dir = TempDir::new().unwrap();
        let dat = dir.path().join("db.dat");
        let engine = StorageEngine::new();
        let users = users_schema();
        let orders = orders_schema();

        engine
            .append_record(&dat, &users, &Record::from_strs(&["1", "alice"]))
            .unwrap();
        engine
            .append_record(&dat, &orders, &Record::from_strs(&["10", "1"]))
            .unwrap();
        engine
            .append_record(&dat, &users, &Record::from_strs(&["2", "bob"]))
            .unwrap();

        let rows = engine.read_records(&dat, &users).unwrap();
        assert_eq!(rows.len(), 2);
        let rows = engine.read_records(&dat, &orders).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].values, vec!["10", "1"]);
    }

    #[test]
    fn test_predicted_offset_matches_append() {
        let dir = TempDir::new().unwrap();
        let dat = dir.path().join("db.dat");
        let engine = StorageEngine::new();
        let schema = users_schema();

        for i in 0..3 {
            let predicted = engine.compute_append_record_offset(&dat, &schema).unwrap();
            let actual = engine
                .append_record(&dat, &schema, &Record::from_strs(&[&i.to_string(), "x"]))
                .unwrap();
            assert_eq!(predicted, actual);
        }
    }

    #[test]
    fn test_in_place_overwrite_roundtrip() {
        let dir = TempDir::new().unwrap();
        let dat = dir.path().join("db.dat");
        let engine = StorageEngine::new();
        let schema = users_schema();

        let offset = engine
            .append_record(&dat, &schema, &Record::from_strs(&["1", "alice"]))
            .unwrap();
        let mut bytes = engine.read_record_bytes_at(&dat, &schema, offset).unwrap();
        bytes[0] = 0; // tombstone
        engine.write_record_bytes_at(&dat, offset, &bytes).unwrap();

        let back = engine.read_record_at(&dat, &schema, offset).unwrap();
        assert!(!back.valid);
        assert_eq!(back.values, vec!["1", "alice"]);
        assert!(engine
            .read_records_with_offsets(&dat, &schema)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_serialize_fixed_length_rejects_resize() {
        let engine = StorageEngine::new();
        let schema = users_schema();
        let original = engine
            .serialize_record(&schema, &Record::from_strs(&["1", "alice"]))
            .unwrap();
        let grown = Record::from_strs(&["1", "alexander"]);
        let err = engine
            .serialize_fixed_length(&schema, &grown, original.len(), 17)
            .unwrap_err();
        assert!(matches!(err, Error::RecordLengthChanged { .. }));
    }

    #[test]
    fn test_write_insert_block_at_reproduces_append() {
        let dir = TempDir::new().unwrap();
        let dat = dir.path().join("a.dat");
        let replay = dir.path().join("b.dat");
        let engine = StorageEngine::new();
        let schema = users_schema();

        let record = Record::from_strs(&["1", "alice"]);
        let offset = engine.append_record(&dat, &schema, &record).unwrap();
        let bytes = engine.serialize_record(&schema, &record).unwrap();

        engine
            .write_insert_block_at(&replay, &schema, offset, &bytes)
            .unwrap();
        assert_eq!(
            std::fs::read(&dat).unwrap(),
            std::fs::read(&replay).unwrap()
        );
    }

    #[test]
    fn test_save_records_preserves_other_tables() {
        let dir = TempDir::new().unwrap();
        let dbf = dir.path().join("db.dbf");
        let dat = dir.path().join("db.dat");
        let engine = StorageEngine::new();
        let users = users_schema();
        let orders = orders_schema();
        engine.save_schemas(&dbf, &[users.clone(), orders.clone()]).unwrap();

        engine
            .append_record(&dat, &users, &Record::from_strs(&["1", "alice"]))
            .unwrap();
        engine
            .append_record(&dat, &orders, &Record::from_strs(&["10", "1"]))
            .unwrap();

        // Rewrite users only; orders must survive.
        engine
            .save_records(&dat, &dbf, &users, &[Record::from_strs(&["7", "gina"])])
            .unwrap();
        let user_rows = engine.read_records(&dat, &users).unwrap();
        assert_eq!(user_rows.len(), 1);
        assert_eq!(user_rows[0].values, vec!["7", "gina"]);
        let order_rows = engine.read_records(&dat, &orders).unwrap();
        assert_eq!(order_rows.len(), 1);
    }

    #[test]
    fn test_index_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index").join("users.PRIMARY.idx");
        let engine = StorageEngine::new();

        let mut index = BTreeMap::new();
        index.insert("1".to_string(), 17u64);
        index.insert("2".to_string(), 63u64);
        engine.save_index(&path, &index).unwrap();
        assert_eq!(engine.load_index(&path).unwrap(), index);
        assert!(engine
            .load_index(&dir.path().join("missing.idx"))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_bad_separator_is_corruption() {
        let dir = TempDir::new().unwrap();
        let dat = dir.path().join("db.dat");
        std::fs::write(&dat, b"garbage").unwrap();
        let engine = StorageEngine::new();
        let err = engine.read_records(&dat, &users_schema()).unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[test]
    fn test_create_database_twice_fails() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::new();
        engine.create_database(dir.path(), "shop").unwrap();
        let err = engine.create_database(dir.path(), "shop").unwrap_err();
        assert!(matches!(err, Error::DatabaseAlreadyExists(_)));
    }
}
