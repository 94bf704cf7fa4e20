//! Fully materialized row view over a response body.

use crate::error::ClientError;
use crate::proto::*;
use crate::request::SqlRow;
use rmpv::Value;
use serde::de::DeserializeOwned;

/// Rows of a completed data request.
///
/// EVAL and both CALL flavors produce one logical row holding the returned
/// values; SELECT-like results hold one row per tuple.
pub struct ResultSet {
    rows: Vec<Row>,
}

impl ResultSet {
    pub(crate) fn new(data: Value, single_result_row: bool) -> Result<Self, ClientError> {
        let items = match data {
            Value::Array(items) => items,
            Value::Nil => Vec::new(),
            other => {
                return Err(ClientError::Usage(format!(
                    "result body is not an array: {}",
                    other
                )));
            }
        };
        let rows = if single_result_row {
            vec![Row { cells: items }]
        } else {
            items
                .into_iter()
                .map(|item| match item {
                    Value::Array(cells) => Row { cells },
                    other => Row { cells: vec![other] },
                })
                .collect()
        };
        Ok(Self { rows })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    #[inline]
    pub fn row(&self, i: usize) -> Option<&Row> {
        self.rows.get(i)
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }
}

/// One row with positional, width-checked accessors.
///
/// Primitive numeric getters read null as the type's zero; the `opt_`
/// variants read null as `None`. Out-of-range narrowing fails instead of
/// wrapping.
pub struct Row {
    cells: Vec<Value>,
}

fn column_missing(i: usize) -> ClientError {
    ClientError::Usage(format!("row has no column {}", i))
}

fn not_numeric(i: usize, v: &Value) -> ClientError {
    ClientError::Usage(format!("column {} is not numeric: {}", i, v))
}

fn out_of_range(i: usize, ty: &str) -> ClientError {
    ClientError::Usage(format!("column {} is out of range for {}", i, ty))
}

impl Row {
    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn value(&self, i: usize) -> Option<&Value> {
        self.cells.get(i)
    }

    pub fn is_null(&self, i: usize) -> Result<bool, ClientError> {
        Ok(matches!(self.cells.get(i).ok_or_else(|| column_missing(i))?, Value::Nil))
    }

    pub fn get_i64(&self, i: usize) -> Result<i64, ClientError> {
        match self.cells.get(i).ok_or_else(|| column_missing(i))? {
            Value::Nil => Ok(0),
            v => v.as_i64().ok_or_else(|| match v.as_u64() {
                Some(_) => out_of_range(i, "i64"),
                None => not_numeric(i, v),
            }),
        }
    }

    pub fn get_u64(&self, i: usize) -> Result<u64, ClientError> {
        match self.cells.get(i).ok_or_else(|| column_missing(i))? {
            Value::Nil => Ok(0),
            v => v.as_u64().ok_or_else(|| match v.as_i64() {
                Some(_) => out_of_range(i, "u64"),
                None => not_numeric(i, v),
            }),
        }
    }

    pub fn get_i32(&self, i: usize) -> Result<i32, ClientError> {
        let wide = self.get_i64(i)?;
        i32::try_from(wide).map_err(|_| out_of_range(i, "i32"))
    }

    pub fn get_i16(&self, i: usize) -> Result<i16, ClientError> {
        let wide = self.get_i64(i)?;
        i16::try_from(wide).map_err(|_| out_of_range(i, "i16"))
    }

    pub fn get_u32(&self, i: usize) -> Result<u32, ClientError> {
        let wide = self.get_u64(i)?;
        u32::try_from(wide).map_err(|_| out_of_range(i, "u32"))
    }

    pub fn get_f64(&self, i: usize) -> Result<f64, ClientError> {
        match self.cells.get(i).ok_or_else(|| column_missing(i))? {
            Value::Nil => Ok(0.0),
            Value::F32(v) => Ok(*v as f64),
            Value::F64(v) => Ok(*v),
            v => match v.as_i64() {
                Some(n) => Ok(n as f64),
                None => Err(not_numeric(i, v)),
            },
        }
    }

    pub fn opt_i64(&self, i: usize) -> Result<Option<i64>, ClientError> {
        if self.is_null(i)? { Ok(None) } else { self.get_i64(i).map(Some) }
    }

    pub fn opt_str(&self, i: usize) -> Result<Option<&str>, ClientError> {
        match self.cells.get(i).ok_or_else(|| column_missing(i))? {
            Value::Nil => Ok(None),
            Value::String(s) => {
                s.as_str().map(Some).ok_or_else(|| ClientError::Usage(format!(
                    "column {} is not valid utf-8",
                    i
                )))
            }
            v => Err(ClientError::Usage(format!("column {} is not a string: {}", i, v))),
        }
    }

    pub fn get_str(&self, i: usize) -> Result<&str, ClientError> {
        self.opt_str(i)?
            .ok_or_else(|| ClientError::Usage(format!("column {} is null", i)))
    }

    pub fn get_bytes(&self, i: usize) -> Result<&[u8], ClientError> {
        match self.cells.get(i).ok_or_else(|| column_missing(i))? {
            Value::Binary(b) => Ok(b),
            v => Err(ClientError::Usage(format!("column {} is not binary: {}", i, v))),
        }
    }

    /// Decodes the whole row into a serde-deserializable type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        rmpv::ext::from_value(Value::Array(self.cells.clone()))
            .map_err(|e| ClientError::Usage(format!("cannot decode row: {}", e)))
    }
}

/// Decodes the SQL completion body: a SQL_INFO row count for updates, or
/// METADATA column names zipped with DATA rows for queries.
pub(crate) fn decode_sql_body(packet: &crate::codec::RawPacket) -> Result<crate::request::Payload, ClientError> {
    use crate::request::Payload;
    if let Some(info) = packet.field(KEY_SQL_INFO) {
        let count = match info {
            Value::Map(pairs) => pairs
                .iter()
                .find(|(k, _)| k.as_u64() == Some(SQL_INFO_ROW_COUNT))
                .and_then(|(_, v)| v.as_u64()),
            _ => None,
        };
        let count = count
            .ok_or_else(|| ClientError::Usage("sql info has no row count".to_string()))?;
        return Ok(Payload::RowCount(count));
    }
    let names: Vec<String> = match packet.field(KEY_METADATA) {
        Some(Value::Array(columns)) => columns
            .iter()
            .map(|col| match col {
                Value::Map(pairs) => pairs
                    .iter()
                    .find(|(k, _)| k.as_u64() == Some(METADATA_FIELD_NAME))
                    .and_then(|(_, v)| v.as_str())
                    .map(|s| s.to_string())
                    .ok_or_else(|| ClientError::Usage("metadata column has no name".to_string())),
                _ => Err(ClientError::Usage("metadata column is not a map".to_string())),
            })
            .collect::<Result<_, _>>()?,
        _ => Vec::new(),
    };
    let mut rows: Vec<SqlRow> = Vec::new();
    if let Some(Value::Array(data)) = packet.field(KEY_DATA) {
        for tuple in data {
            let Value::Array(cells) = tuple else {
                return Err(ClientError::Usage("sql row is not an array".to_string()));
            };
            let mut row = SqlRow::default();
            for (name, cell) in names.iter().zip(cells.iter()) {
                row.insert(name.clone(), cell.clone());
            }
            rows.push(row);
        }
    }
    Ok(Payload::SqlRows(rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::request::Payload;

    fn row(cells: Vec<Value>) -> Row {
        Row { cells }
    }

    #[test]
    fn test_multi_row_construction() {
        let data = Value::Array(vec![
            Value::Array(vec![Value::from(1u64), Value::from("a")]),
            Value::Array(vec![Value::from(2u64), Value::from("b")]),
        ]);
        let rs = ResultSet::new(data, false).expect("rows");
        assert_eq!(rs.len(), 2);
        assert_eq!(rs.row(0).unwrap().get_u64(0).unwrap(), 1);
        assert_eq!(rs.row(1).unwrap().get_str(1).unwrap(), "b");
    }

    #[test]
    fn test_single_result_row_construction() {
        let data = Value::Array(vec![Value::from(41u64), Value::from(42u64)]);
        let rs = ResultSet::new(data, true).expect("rows");
        assert_eq!(rs.len(), 1);
        let row = rs.row(0).unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row.get_u64(1).unwrap(), 42);
    }

    #[test]
    fn test_width_conversions() {
        let r = row(vec![Value::from(300i64), Value::from(i64::from(i16::MAX))]);
        assert_eq!(r.get_i64(0).unwrap(), 300);
        assert_eq!(r.get_i32(0).unwrap(), 300);
        assert!(matches!(r.get_i16(0), Err(ClientError::Usage(_))));
        assert_eq!(r.get_i16(1).unwrap(), i16::MAX);
    }

    #[test]
    fn test_sign_boundaries() {
        let r = row(vec![Value::from(u64::MAX), Value::from(-1i64)]);
        assert_eq!(r.get_u64(0).unwrap(), u64::MAX);
        assert!(matches!(r.get_i64(0), Err(ClientError::Usage(_))));
        assert_eq!(r.get_i64(1).unwrap(), -1);
        assert!(matches!(r.get_u64(1), Err(ClientError::Usage(_))));
    }

    #[test]
    fn test_null_semantics() {
        let r = row(vec![Value::Nil]);
        assert_eq!(r.get_i64(0).unwrap(), 0);
        assert_eq!(r.get_u64(0).unwrap(), 0);
        assert_eq!(r.get_f64(0).unwrap(), 0.0);
        assert_eq!(r.opt_i64(0).unwrap(), None);
        assert_eq!(r.opt_str(0).unwrap(), None);
        assert!(matches!(r.get_str(0), Err(ClientError::Usage(_))));
        assert!(r.is_null(0).unwrap());
    }

    #[test]
    fn test_missing_column() {
        let r = row(vec![]);
        assert!(matches!(r.get_i64(3), Err(ClientError::Usage(_))));
    }

    #[test]
    fn test_typed_decode() {
        let r = row(vec![Value::from(7u64), Value::from("name")]);
        let decoded: (u64, String) = r.decode().expect("decode");
        assert_eq!(decoded, (7, "name".to_string()));
    }

    #[test]
    fn test_typed_decode_into_struct() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Account {
            id: u64,
            name: String,
            balance: Option<i64>,
        }
        let r = row(vec![Value::from(7u64), Value::from("ada"), Value::Nil]);
        let decoded: Account = r.decode().expect("decode");
        assert_eq!(decoded, Account { id: 7, name: "ada".to_string(), balance: None });
        let r = row(vec![Value::from(8u64), Value::from("bob"), Value::from(-5i64)]);
        let decoded: Account = r.decode().expect("decode");
        assert_eq!(decoded.balance, Some(-5));
        // a short tuple does not silently decode into a wider struct
        let r = row(vec![Value::from(9u64)]);
        assert!(r.decode::<Account>().is_err());
    }

    #[test]
    fn test_sql_row_count_body() {
        let frame = codec::encode_response(
            CODE_SUCCESS,
            1,
            5,
            &[(KEY_SQL_INFO, Value::Map(vec![(Value::from(SQL_INFO_ROW_COUNT), Value::from(3u64))]))],
        )
        .unwrap();
        let packet = futures::executor::block_on(async {
            let mut r = &frame[..];
            let mut scratch = bytes::BytesMut::new();
            codec::read_frame(&mut r, &mut scratch).await.unwrap()
        });
        assert_eq!(decode_sql_body(&packet).unwrap(), Payload::RowCount(3));
    }

    #[test]
    fn test_sql_named_rows_body() {
        let metadata = Value::Array(vec![
            Value::Map(vec![(Value::from(METADATA_FIELD_NAME), Value::from("ID"))]),
            Value::Map(vec![(Value::from(METADATA_FIELD_NAME), Value::from("NAME"))]),
        ]);
        let data = Value::Array(vec![Value::Array(vec![Value::from(1u64), Value::from("n")])]);
        let frame = codec::encode_response(
            CODE_SUCCESS,
            1,
            5,
            &[(KEY_METADATA, metadata), (KEY_DATA, data)],
        )
        .unwrap();
        let packet = futures::executor::block_on(async {
            let mut r = &frame[..];
            let mut scratch = bytes::BytesMut::new();
            codec::read_frame(&mut r, &mut scratch).await.unwrap()
        });
        let Payload::SqlRows(rows) = decode_sql_body(&packet).unwrap() else {
            panic!("expected rows");
        };
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["ID"], Value::from(1u64));
        assert_eq!(rows[0]["NAME"], Value::from("n"));
    }
}
