//! # Schema Descriptors
//!
//! Typed per-table descriptors for every syncable table, and the
//! translation between local (SQLite) and remote (hosted) record shapes.
//!
//! ## Translation
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                  Local Record  ⇄  Remote Record                          │
//! │                                                                         │
//! │   local field        Field descriptor           remote column          │
//! │   ───────────        ────────────────           ─────────────          │
//! │   price        ────► renamed(Real)       ────►  sale_price             │
//! │   is_active    ────► renamed(Bool)       ────►  active   (0/1 ⇄ bool)  │
//! │   attributes   ────► both(Json)          ────►  attributes (text ⇄ json)│
//! │   last_login   ────► local_only          ──✗                           │
//! │                      remote_only + default ──►  unit = 'unit'          │
//! │   (unknown)    ──✗   not in whitelist                                  │
//! │                                                                         │
//! │   TranslateMode::Full     inserts: remote defaults are injected        │
//! │   TranslateMode::Partial  patches: only the fields present are sent    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Priority
//! Tables are declared parents first. A drain pass replays entries in this
//! order so a sale is never uploaded before the register and products it
//! references.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::types::{format_timestamp, now_timestamp, parse_timestamp, Record};

// =============================================================================
// Syncable Tables
// =============================================================================

/// Every table the engine mirrors between the two stores.
///
/// Variant order is the replay priority: independent catalog tables first,
/// dependent transactional tables last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    Settings,
    Categories,
    Users,
    Customers,
    Products,
    CashRegisters,
    Sales,
    SaleItems,
    InventoryMovements,
}

impl SyncTable {
    /// All syncable tables in priority order.
    pub const ALL: [SyncTable; 9] = [
        SyncTable::Settings,
        SyncTable::Categories,
        SyncTable::Users,
        SyncTable::Customers,
        SyncTable::Products,
        SyncTable::CashRegisters,
        SyncTable::Sales,
        SyncTable::SaleItems,
        SyncTable::InventoryMovements,
    ];

    /// Tables copied from the remote store during a pull.
    ///
    /// Transactional tables are produced by terminals and only flow upward.
    pub const PULLED: [SyncTable; 6] = [
        SyncTable::Settings,
        SyncTable::Categories,
        SyncTable::Users,
        SyncTable::Customers,
        SyncTable::Products,
        SyncTable::CashRegisters,
    ];

    /// Local table name.
    pub fn as_str(&self) -> &'static str {
        self.schema().local
    }

    /// Replay priority, lower first.
    pub fn priority(&self) -> u8 {
        *self as u8
    }

    /// The static descriptor for this table.
    pub fn schema(&self) -> &'static TableSchema {
        match self {
            SyncTable::Settings => &SETTINGS,
            SyncTable::Categories => &CATEGORIES,
            SyncTable::Users => &USERS,
            SyncTable::Customers => &CUSTOMERS,
            SyncTable::Products => &PRODUCTS,
            SyncTable::CashRegisters => &CASH_REGISTERS,
            SyncTable::Sales => &SALES,
            SyncTable::SaleItems => &SALE_ITEMS,
            SyncTable::InventoryMovements => &INVENTORY_MOVEMENTS,
        }
    }
}

impl std::fmt::Display for SyncTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SyncTable {
    type Err = CoreError;

    /// Accepts either the local or the remote table name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncTable::ALL
            .iter()
            .copied()
            .find(|t| t.schema().local == s || t.schema().remote == s)
            .ok_or_else(|| CoreError::UnknownTable(s.to_string()))
    }
}

// =============================================================================
// Field Descriptors
// =============================================================================

/// How a column's value is represented on each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Real,
    /// `0`/`1` locally, a real boolean remotely.
    Bool,
    /// RFC 3339 text on both sides, normalised on the way in.
    Timestamp,
    /// Serialized JSON text locally, a JSON value remotely.
    Json,
}

/// Value injected for a remote NOT NULL column the local record lacks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(&'static str),
    /// The current time at translation.
    Now,
}

impl DefaultValue {
    fn to_value(self) -> Value {
        match self {
            DefaultValue::Bool(b) => Value::Bool(b),
            DefaultValue::Int(i) => Value::from(i),
            DefaultValue::Real(r) => Value::from(r),
            DefaultValue::Text(s) => Value::from(s),
            DefaultValue::Now => Value::from(now_timestamp()),
        }
    }
}

/// One column and its presence on each side.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Field {
    pub local: Option<&'static str>,
    pub remote: Option<&'static str>,
    pub kind: FieldKind,
    pub remote_default: Option<DefaultValue>,
}

impl Field {
    /// Same name on both sides.
    pub const fn both(name: &'static str, kind: FieldKind) -> Self {
        Field {
            local: Some(name),
            remote: Some(name),
            kind,
            remote_default: None,
        }
    }

    pub const fn renamed(local: &'static str, remote: &'static str, kind: FieldKind) -> Self {
        Field {
            local: Some(local),
            remote: Some(remote),
            kind,
            remote_default: None,
        }
    }

    /// Never sent to the remote store.
    pub const fn local_only(name: &'static str, kind: FieldKind) -> Self {
        Field {
            local: Some(name),
            remote: None,
            kind,
            remote_default: None,
        }
    }

    /// Exists only remotely; populated from `default` on inserts.
    pub const fn remote_only(name: &'static str, kind: FieldKind, default: DefaultValue) -> Self {
        Field {
            local: None,
            remote: Some(name),
            kind,
            remote_default: Some(default),
        }
    }

    /// Adds a remote default to a mapped column.
    pub const fn or_default(self, default: DefaultValue) -> Self {
        Field {
            remote_default: Some(default),
            ..self
        }
    }

    fn value_to_remote(&self, value: &Value) -> Value {
        match (self.kind, value) {
            (FieldKind::Bool, Value::Number(n)) => Value::Bool(n.as_f64().unwrap_or(0.0) != 0.0),
            (FieldKind::Bool, Value::String(s)) => {
                Value::Bool(matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
            }
            (FieldKind::Json, Value::String(s)) => {
                serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))
            }
            _ => value.clone(),
        }
    }

    fn value_to_local(&self, value: &Value) -> Value {
        match (self.kind, value) {
            (FieldKind::Bool, Value::Bool(b)) => Value::from(i64::from(*b)),
            (FieldKind::Json, Value::Object(_) | Value::Array(_)) => Value::String(value.to_string()),
            (FieldKind::Timestamp, Value::String(s)) => match parse_timestamp(s) {
                Some(at) => Value::String(format_timestamp(at)),
                None => value.clone(),
            },
            _ => value.clone(),
        }
    }
}

/// Whether remote defaults are injected during local → remote translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranslateMode {
    /// Complete row for an insert.
    Full,
    /// Patch for an update; absent fields stay untouched remotely.
    Partial,
}

// =============================================================================
// Table Schema
// =============================================================================

/// Static descriptor of one syncable table.
#[derive(Debug)]
pub struct TableSchema {
    pub local: &'static str,
    pub remote: &'static str,
    /// Primary key column, identical on both sides.
    pub primary_key: &'static str,
    /// Local column used for newer-wins comparison during pull.
    pub last_modified: Option<&'static str>,
    pub fields: &'static [Field],
}

impl TableSchema {
    /// Local column names in declaration order.
    pub fn local_columns(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().filter_map(|f| f.local)
    }

    pub fn field(&self, local_name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.local == Some(local_name))
    }

    /// Translates a local record into the remote shape.
    ///
    /// Renames mapped fields, drops local-only and unknown fields, and in
    /// [`TranslateMode::Full`] fills remote defaults for missing or null
    /// columns.
    pub fn to_remote(&self, record: &Record, mode: TranslateMode) -> Record {
        let mut out = Record::new();

        for field in self.fields {
            let Some(remote) = field.remote else { continue };

            if let Some(value) = field.local.and_then(|local| record.get(local)) {
                out.insert(remote.to_string(), field.value_to_remote(value));
            }

            if mode == TranslateMode::Full {
                if let Some(default) = field.remote_default {
                    let missing = out.get(remote).map_or(true, Value::is_null);
                    if missing {
                        out.insert(remote.to_string(), default.to_value());
                    }
                }
            }
        }

        out
    }

    /// Translates a remote record into the local shape.
    ///
    /// Remote-only and unknown columns are dropped.
    pub fn to_local(&self, record: &Record) -> Record {
        let mut out = Record::new();

        for field in self.fields {
            let (Some(local), Some(remote)) = (field.local, field.remote) else {
                continue;
            };
            if let Some(value) = record.get(remote) {
                out.insert(local.to_string(), field.value_to_local(value));
            }
        }

        out
    }

    /// Extracts the primary key value of a local record as text.
    pub fn record_id(&self, record: &Record) -> CoreResult<String> {
        match record.get(self.primary_key) {
            Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            _ => Err(CoreError::MissingPrimaryKey {
                table: self.local.to_string(),
                key: self.primary_key.to_string(),
            }),
        }
    }

    /// Reads the last-modified timestamp of a local record.
    pub fn modified_at(&self, record: &Record) -> Option<DateTime<Utc>> {
        let column = self.last_modified?;
        record.get(column)?.as_str().and_then(parse_timestamp)
    }
}

// =============================================================================
// Table Definitions
// =============================================================================

use DefaultValue as D;
use FieldKind::*;

static SETTINGS: TableSchema = TableSchema {
    local: "settings",
    remote: "settings",
    primary_key: "key",
    last_modified: Some("updated_at"),
    fields: &[
        Field::both("key", Text),
        Field::both("value", Text),
        Field::both("updated_at", Timestamp),
    ],
};

static CATEGORIES: TableSchema = TableSchema {
    local: "categories",
    remote: "categories",
    primary_key: "id",
    last_modified: Some("updated_at"),
    fields: &[
        Field::both("id", Text),
        Field::both("name", Text),
        Field::both("description", Text),
        Field::both("parent_id", Text),
        Field::renamed("is_active", "active", Bool).or_default(D::Bool(true)),
        Field::both("created_at", Timestamp).or_default(D::Now),
        Field::both("updated_at", Timestamp),
    ],
};

static USERS: TableSchema = TableSchema {
    local: "users",
    remote: "users",
    primary_key: "id",
    last_modified: Some("updated_at"),
    fields: &[
        Field::both("id", Text),
        Field::both("username", Text),
        Field::renamed("full_name", "display_name", Text),
        Field::both("role", Text).or_default(D::Text("cashier")),
        Field::renamed("is_active", "active", Bool).or_default(D::Bool(true)),
        Field::local_only("last_login_at", Timestamp),
        Field::both("created_at", Timestamp).or_default(D::Now),
        Field::both("updated_at", Timestamp),
    ],
};

static CUSTOMERS: TableSchema = TableSchema {
    local: "customers",
    remote: "customers",
    primary_key: "id",
    last_modified: Some("updated_at"),
    fields: &[
        Field::both("id", Text),
        Field::both("name", Text),
        Field::both("email", Text),
        Field::both("phone", Text),
        Field::renamed("tax_id", "document_number", Text),
        Field::both("address", Text),
        Field::both("notes", Text),
        Field::remote_only("loyalty_points", Integer, D::Int(0)),
        Field::both("created_at", Timestamp).or_default(D::Now),
        Field::both("updated_at", Timestamp),
    ],
};

static PRODUCTS: TableSchema = TableSchema {
    local: "products",
    remote: "products",
    primary_key: "id",
    last_modified: Some("updated_at"),
    fields: &[
        Field::both("id", Text),
        Field::both("sku", Text),
        Field::both("barcode", Text),
        Field::both("name", Text),
        Field::both("description", Text),
        Field::both("category_id", Text),
        Field::renamed("price", "sale_price", Real).or_default(D::Real(0.0)),
        Field::renamed("cost", "cost_price", Real).or_default(D::Real(0.0)),
        Field::renamed("stock", "stock_quantity", Integer).or_default(D::Int(0)),
        Field::both("min_stock", Integer),
        Field::renamed("is_active", "active", Bool).or_default(D::Bool(true)),
        Field::both("attributes", Json),
        Field::remote_only("unit", Text, D::Text("unit")),
        Field::remote_only("tax_rate", Real, D::Real(0.0)),
        Field::both("created_at", Timestamp).or_default(D::Now),
        Field::both("updated_at", Timestamp),
    ],
};

static CASH_REGISTERS: TableSchema = TableSchema {
    local: "cash_registers",
    remote: "cash_registers",
    primary_key: "id",
    last_modified: Some("updated_at"),
    fields: &[
        Field::both("id", Text),
        Field::both("name", Text),
        Field::both("status", Text).or_default(D::Text("closed")),
        Field::renamed("opened_by", "opened_by_user_id", Text),
        Field::both("opening_balance", Real).or_default(D::Real(0.0)),
        Field::both("current_balance", Real).or_default(D::Real(0.0)),
        Field::both("opened_at", Timestamp),
        Field::both("closed_at", Timestamp),
        Field::both("created_at", Timestamp).or_default(D::Now),
        Field::both("updated_at", Timestamp),
    ],
};

static SALES: TableSchema = TableSchema {
    local: "sales",
    remote: "sales",
    primary_key: "id",
    last_modified: Some("updated_at"),
    fields: &[
        Field::both("id", Text),
        Field::both("receipt_number", Text),
        Field::renamed("register_id", "cash_register_id", Text),
        Field::both("user_id", Text),
        Field::both("customer_id", Text),
        Field::both("subtotal", Real),
        Field::both("tax_total", Real).or_default(D::Real(0.0)),
        Field::both("discount_total", Real).or_default(D::Real(0.0)),
        Field::both("total", Real),
        Field::both("payment_method", Text),
        Field::both("status", Text).or_default(D::Text("completed")),
        Field::remote_only("channel", Text, D::Text("pos")),
        Field::both("created_at", Timestamp).or_default(D::Now),
        Field::both("updated_at", Timestamp),
    ],
};

static SALE_ITEMS: TableSchema = TableSchema {
    local: "sale_items",
    remote: "sale_items",
    primary_key: "id",
    last_modified: None,
    fields: &[
        Field::both("id", Text),
        Field::both("sale_id", Text),
        Field::both("product_id", Text),
        Field::both("quantity", Real),
        Field::both("unit_price", Real),
        Field::both("discount", Real).or_default(D::Real(0.0)),
        Field::both("line_total", Real),
        Field::remote_only("created_at", Timestamp, D::Now),
    ],
};

static INVENTORY_MOVEMENTS: TableSchema = TableSchema {
    local: "inventory_movements",
    remote: "inventory_movements",
    primary_key: "id",
    last_modified: None,
    fields: &[
        Field::both("id", Text),
        Field::both("product_id", Text),
        Field::renamed("kind", "movement_type", Text),
        Field::both("quantity", Real),
        Field::both("reason", Text),
        Field::both("reference_id", Text),
        Field::both("user_id", Text),
        Field::both("created_at", Timestamp).or_default(D::Now),
    ],
};

// =============================================================================
// Unit Tests
// =============================================================================
