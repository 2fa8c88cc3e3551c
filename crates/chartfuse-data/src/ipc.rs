//! Arrow interchange for [`Table`].
//!
//! Tables travel to clients as Arrow IPC streams (raw or base64) and arrive
//! from callers as CSV text. JSON-typed columns are carried as strings with
//! a field metadata marker so they decode back into structured values.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use arrow::csv::reader::Format;
use arrow::datatypes::{DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::json::reader::ReaderBuilder as JsonReaderBuilder;
use arrow::json::writer::{JsonArray, WriterBuilder};
use arrow::record_batch::RecordBatch;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;

use crate::error::DataResult;
use crate::schema::{DataType, Field, Schema};
use crate::table::{Row, Table};

const TYPE_METADATA_KEY: &str = "chartfuse:type";
const JSON_TYPE_MARKER: &str = "json";

impl Table {
    /// Arrow schema equivalent of this table's schema.
    pub fn arrow_schema(&self) -> ArrowSchema {
        let fields: Vec<ArrowField> = self
            .schema()
            .fields()
            .iter()
            .map(|field| match field.data_type {
                DataType::Null => ArrowField::new(&field.name, ArrowType::Null, true),
                DataType::Boolean => ArrowField::new(&field.name, ArrowType::Boolean, true),
                DataType::Integer => ArrowField::new(&field.name, ArrowType::Int64, true),
                DataType::Float => ArrowField::new(&field.name, ArrowType::Float64, true),
                DataType::Utf8 => ArrowField::new(&field.name, ArrowType::Utf8, true),
                DataType::Json => ArrowField::new(&field.name, ArrowType::Utf8, true)
                    .with_metadata(HashMap::from([(
                        TYPE_METADATA_KEY.to_string(),
                        JSON_TYPE_MARKER.to_string(),
                    )])),
            })
            .collect();
        ArrowSchema::new(fields)
    }

    /// Convert into a single Arrow record batch.
    pub fn to_record_batch(&self) -> DataResult<RecordBatch> {
        let schema = Arc::new(self.arrow_schema());
        let encoded: Vec<Value> = self
            .rows()
            .iter()
            .map(|row| encode_row(self.schema(), row))
            .collect();
        let mut decoder = JsonReaderBuilder::new(Arc::clone(&schema))
            .with_batch_size(encoded.len().max(1))
            .with_coerce_primitive(true)
            .build_decoder()?;
        decoder.serialize(&encoded)?;
        let batch = decoder
            .flush()?
            .unwrap_or_else(|| RecordBatch::new_empty(Arc::clone(&schema)));
        Ok(batch)
    }

    /// Rebuild a table from Arrow record batches sharing `schema`.
    pub fn from_record_batches(schema: &ArrowSchema, batches: &[RecordBatch]) -> DataResult<Self> {
        let (table_schema, json_fields) = from_arrow_schema(schema);

        let mut writer = WriterBuilder::new()
            .with_explicit_nulls(true)
            .build::<_, JsonArray>(Vec::new());
        let refs: Vec<&RecordBatch> = batches.iter().collect();
        writer.write_batches(&refs)?;
        writer.finish()?;
        let buf = writer.into_inner();

        let mut rows: Vec<Row> = if buf.is_empty() {
            Vec::new()
        } else {
            serde_json::from_slice(&buf)?
        };
        if !json_fields.is_empty() {
            for row in rows.iter_mut() {
                for name in &json_fields {
                    if let Some(Value::String(text)) = row.get(name) {
                        let parsed = serde_json::from_str(text)?;
                        row.insert(name.clone(), parsed);
                    }
                }
            }
        }
        Ok(Table::new(table_schema, rows))
    }

    /// Serialize as an Arrow IPC stream.
    pub fn to_ipc_bytes(&self) -> DataResult<Vec<u8>> {
        let batch = self.to_record_batch()?;
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &batch.schema())?;
            writer.write(&batch)?;
            writer.finish()?;
        }
        Ok(buf)
    }

    /// Parse an Arrow IPC stream.
    pub fn from_ipc_bytes(bytes: &[u8]) -> DataResult<Self> {
        let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
        let schema = reader.schema();
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        Self::from_record_batches(&schema, &batches)
    }

    pub fn to_ipc_base64(&self) -> DataResult<String> {
        Ok(STANDARD.encode(self.to_ipc_bytes()?))
    }

    pub fn from_ipc_base64(encoded: &str) -> DataResult<Self> {
        let bytes = STANDARD.decode(encoded.trim())?;
        Self::from_ipc_bytes(&bytes)
    }

    /// Parse CSV text with a header row, inferring column types.
    pub fn from_csv_str(text: &str) -> DataResult<Self> {
        let format = Format::default().with_header(true);
        let (schema, _) = format.infer_schema(Cursor::new(text.as_bytes()), None)?;
        let schema = Arc::new(schema);
        let reader = arrow::csv::ReaderBuilder::new(Arc::clone(&schema))
            .with_header(true)
            .build(Cursor::new(text.as_bytes()))?;
        let batches = reader.collect::<Result<Vec<_>, _>>()?;
        Self::from_record_batches(&schema, &batches)
    }
}

fn encode_row(schema: &Schema, row: &Row) -> Value {
    let mut out = serde_json::Map::with_capacity(schema.len());
    for field in schema.fields() {
        let value = match row.get(&field.name) {
            None | Some(Value::Null) => continue,
            Some(value) => value,
        };
        let encoded = match field.data_type {
            DataType::Null => continue,
            DataType::Json => Value::String(value.to_string()),
            _ => value.clone(),
        };
        out.insert(field.name.clone(), encoded);
    }
    Value::Object(out)
}

fn from_arrow_schema(schema: &ArrowSchema) -> (Schema, Vec<String>) {
    let mut json_fields = Vec::new();
    let fields = schema
        .fields()
        .iter()
        .map(|field| {
            let tagged_json = field
                .metadata()
                .get(TYPE_METADATA_KEY)
                .is_some_and(|t| t == JSON_TYPE_MARKER);
            let data_type = if tagged_json {
                json_fields.push(field.name().clone());
                DataType::Json
            } else {
                match field.data_type() {
                    ArrowType::Null => DataType::Null,
                    ArrowType::Boolean => DataType::Boolean,
                    ArrowType::Int8
                    | ArrowType::Int16
                    | ArrowType::Int32
                    | ArrowType::Int64
                    | ArrowType::UInt8
                    | ArrowType::UInt16
                    | ArrowType::UInt32
                    | ArrowType::UInt64 => DataType::Integer,
                    ArrowType::Float16 | ArrowType::Float32 | ArrowType::Float64 => {
                        DataType::Float
                    }
                    ArrowType::List(_)
                    | ArrowType::LargeList(_)
                    | ArrowType::FixedSizeList(_, _)
                    | ArrowType::Struct(_)
                    | ArrowType::Map(_, _) => DataType::Json,
                    _ => DataType::Utf8,
                }
            };
            Field::new(field.name().clone(), data_type)
        })
        .collect();
    (Schema::new(fields), json_fields)
}
