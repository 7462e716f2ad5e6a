use hashbrown::HashMap;

use crate::{
    error::{InternalError, Result},
    frontend::ast::NodeId,
};

/// The value types of the language. Every array type is spelled out so the
/// type stays `Copy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
pub enum VariableType {
    Variant,
    /// Return type of macros
    #[strum(to_string = "MACRO")]
    NoReturn,
    Integer,
    Integer64,
    Float,
    Money,
    Boolean,
    String,
    Blob,
    DateTime,
    Record,
    Table,
    Object,
    #[strum(to_string = "FUNCTION PTR")]
    FunctionPtr,
    #[strum(to_string = "VARIANT ARRAY")]
    VariantArray,
    #[strum(to_string = "INTEGER ARRAY")]
    IntegerArray,
    #[strum(to_string = "INTEGER64 ARRAY")]
    Integer64Array,
    #[strum(to_string = "FLOAT ARRAY")]
    FloatArray,
    #[strum(to_string = "MONEY ARRAY")]
    MoneyArray,
    #[strum(to_string = "BOOLEAN ARRAY")]
    BooleanArray,
    #[strum(to_string = "STRING ARRAY")]
    StringArray,
    #[strum(to_string = "BLOB ARRAY")]
    BlobArray,
    #[strum(to_string = "DATETIME ARRAY")]
    DateTimeArray,
    #[strum(to_string = "RECORD ARRAY")]
    RecordArray,
    #[strum(to_string = "OBJECT ARRAY")]
    ObjectArray,
    #[strum(to_string = "FUNCTION PTR ARRAY")]
    FunctionPtrArray,
}

impl VariableType {
    pub fn is_array(self) -> bool {
        self.element_type().is_some()
    }

    pub fn element_type(self) -> Option<VariableType> {
        use VariableType::*;

        Some(match self {
            VariantArray => Variant,
            IntegerArray => Integer,
            Integer64Array => Integer64,
            FloatArray => Float,
            MoneyArray => Money,
            BooleanArray => Boolean,
            StringArray => String,
            BlobArray => Blob,
            DateTimeArray => DateTime,
            RecordArray => Record,
            ObjectArray => Object,
            FunctionPtrArray => FunctionPtr,
            _ => return None,
        })
    }

    pub fn array_of(self) -> Option<VariableType> {
        use VariableType::*;

        Some(match self {
            Variant => VariantArray,
            Integer => IntegerArray,
            Integer64 => Integer64Array,
            Float => FloatArray,
            Money => MoneyArray,
            Boolean => BooleanArray,
            String => StringArray,
            Blob => BlobArray,
            DateTime => DateTimeArray,
            Record => RecordArray,
            Object => ObjectArray,
            FunctionPtr => FunctionPtrArray,
            _ => return None,
        })
    }
}

/// Resolved type of every expression node, filled by the type checker and
/// extended by passes that synthesize new expressions.
#[derive(Debug, Default)]
pub struct TypeStorage {
    types: HashMap<NodeId, VariableType>,
}

impl TypeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, node: NodeId, ty: VariableType) {
        self.types.insert(node, ty);
    }

    pub fn get(&self, node: NodeId) -> Result<VariableType> {
        self.types
            .get(&node)
            .copied()
            .ok_or(InternalError::MissingType(node))
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.types.contains_key(&node)
    }
}
