//! Variables and their reader/writer bindings.

use common::{
    data_type::DataType,
    errors::ErrorMetadata,
    is_valid_identifier,
    qualifier::Qualifier,
    value::TagValue,
};

use crate::{
    modbus::ModbusAddress,
    s7::S7Tag,
};

/// A named, typed datum at a protocol-specific address. The value is absent
/// until the first successful read.
#[derive(Clone, Debug)]
pub struct Variable {
    name: String,
    data_type: DataType,
    value: Option<TagValue>,
}

impl Variable {
    pub fn new(name: impl Into<String>, data_type: DataType) -> anyhow::Result<Self> {
        let name = name.into();
        anyhow::ensure!(
            is_valid_identifier(&name),
            ErrorMetadata::bad_argument(
                "BadVariableName",
                format!("Invalid variable name {name:?}"),
            )
        );
        Ok(Self {
            name,
            data_type,
            value: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn value(&self) -> Option<&TagValue> {
        self.value.as_ref()
    }

    pub fn set_value(&mut self, value: TagValue) {
        self.value = Some(value);
    }

    pub fn value_as_text(&self) -> Option<String> {
        self.value.as_ref().map(TagValue::as_text)
    }
}

/// Protocol-specific address binding. Which variant a connection accepts is
/// fixed by its kind; a mismatch is a configuration bug caught at build
/// time.
#[derive(Clone, Debug)]
pub enum Address {
    Modbus(ModbusAddress),
    S7(S7Tag),
    OpcUa(String),
    Json(String),
    /// A `var::connection` qualifier the remote logger resolves.
    Ipc(Qualifier),
}

#[derive(Clone, Debug)]
pub struct Reader {
    pub variable: Variable,
    pub address: Address,
}

impl Reader {
    pub fn new(variable: Variable, address: Address) -> Self {
        Self { variable, address }
    }
}

/// A writer pushes the current value of a bound source reader out to its
/// own address. Until the source produces a value, writers hold the type's
/// zero.
#[derive(Clone, Debug)]
pub struct Writer {
    pub variable: Variable,
    pub address: Address,
    pub source_var: String,
    pub source_connection: String,
}

impl Writer {
    pub fn new(
        mut variable: Variable,
        address: Address,
        source_var: impl Into<String>,
        source_connection: impl Into<String>,
    ) -> Self {
        variable.set_value(TagValue::zero(variable.data_type()));
        Self {
            variable,
            address,
            source_var: source_var.into(),
            source_connection: source_connection.into(),
        }
    }
}
