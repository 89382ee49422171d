//! workspace 字段 schema（显式表，取代注解式声明）
//!
//! storage / validator 都从 `WORKSPACE_FIELDS` 读取字段元数据，不在代码里硬编码规则。

use serde::Serialize;

/// machine name 允许的字符集。注意 `+-/` 是区间，包含 `+ , - . /`。
pub const MACHINE_NAME_PATTERN: &str = r"^[0-9a-z_$()+-/]*$";

pub const LABEL_MAX_LENGTH: usize = 128;
pub const MACHINE_NAME_MAX_LENGTH: usize = 128;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Integer,
    Uuid,
    String,
    EntityReference { target_type: &'static str },
    Created,
    Changed,
    Boolean,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// 值必须匹配正则（整串）
    Pattern(&'static str),
    /// 默认 workspace 不允许取消发布
    UnpublishDefault,
}

/// 字段初始化时由 storage 调用的默认值提供者
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DefaultValue {
    None,
    /// `Workspace::current_user_id`
    CurrentUser,
    RequestTime,
    Uuid,
    Bool(bool),
}

#[derive(Copy, Clone, Debug, Serialize)]
pub struct FieldDefinition {
    pub name: &'static str,
    pub label: &'static str,
    pub description: &'static str,
    pub kind: FieldKind,
    pub revisionable: bool,
    pub read_only: bool,
    pub required: bool,
    pub max_length: Option<usize>,
    pub constraints: &'static [Constraint],
    pub default: DefaultValue,
}

impl FieldDefinition {
    const fn base(name: &'static str, label: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            label,
            description: "",
            kind,
            revisionable: false,
            read_only: false,
            required: false,
            max_length: None,
            constraints: &[],
            default: DefaultValue::None,
        }
    }
}

/// 取值（validator 通用遍历用）
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Integer(Option<i64>),
    String(String),
    Reference(Option<String>),
    Boolean(bool),
    Missing,
}

impl FieldValue {
    pub fn is_empty(&self) -> bool {
        match self {
            FieldValue::Integer(v) => v.is_none(),
            FieldValue::String(s) => s.is_empty(),
            FieldValue::Reference(r) => r.as_deref().map_or(true, str::is_empty),
            FieldValue::Boolean(_) => false,
            FieldValue::Missing => true,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::String(s) => Some(s),
            FieldValue::Reference(r) => r.as_deref(),
            _ => None,
        }
    }
}

pub static WORKSPACE_FIELDS: &[FieldDefinition] = &[
    FieldDefinition {
        description: "The workspace ID.",
        read_only: true,
        ..FieldDefinition::base("id", "ID", FieldKind::Integer)
    },
    FieldDefinition {
        description: "The workspace revision ID.",
        read_only: true,
        ..FieldDefinition::base("revision_id", "Revision ID", FieldKind::Integer)
    },
    FieldDefinition {
        description: "The workspace type.",
        read_only: true,
        ..FieldDefinition::base(
            "type",
            "Type",
            FieldKind::EntityReference {
                target_type: "workspace_type",
            },
        )
    },
    FieldDefinition {
        description: "The workspace UUID.",
        read_only: true,
        default: DefaultValue::Uuid,
        ..FieldDefinition::base("uuid", "UUID", FieldKind::Uuid)
    },
    FieldDefinition {
        description: "The workspace name.",
        revisionable: true,
        required: true,
        max_length: Some(LABEL_MAX_LENGTH),
        ..FieldDefinition::base("label", "Workspace name", FieldKind::String)
    },
    FieldDefinition {
        description: "The workspace machine name.",
        revisionable: true,
        required: true,
        max_length: Some(MACHINE_NAME_MAX_LENGTH),
        constraints: &[Constraint::Pattern(MACHINE_NAME_PATTERN)],
        ..FieldDefinition::base("machine_name", "Workspace ID", FieldKind::String)
    },
    FieldDefinition {
        description: "The workspace owner.",
        revisionable: true,
        default: DefaultValue::CurrentUser,
        ..FieldDefinition::base(
            "uid",
            "Owner",
            FieldKind::EntityReference { target_type: "user" },
        )
    },
    FieldDefinition {
        description: "The UNIX timestamp of when the workspace has been created.",
        default: DefaultValue::RequestTime,
        ..FieldDefinition::base("created", "Created", FieldKind::Created)
    },
    FieldDefinition {
        description: "The time that the workspace was last edited.",
        revisionable: true,
        ..FieldDefinition::base("changed", "Changed", FieldKind::Changed)
    },
    FieldDefinition {
        description: "A boolean indicating the published state.",
        revisionable: true,
        default: DefaultValue::Bool(true),
        constraints: &[Constraint::UnpublishDefault],
        ..FieldDefinition::base("published", "Published", FieldKind::Boolean)
    },
];

pub fn field_definition(name: &str) -> Option<&'static FieldDefinition> {
    WORKSPACE_FIELDS.iter().find(|f| f.name == name)
}

pub fn revisionable_fields() -> impl Iterator<Item = &'static FieldDefinition> {
    WORKSPACE_FIELDS.iter().filter(|f| f.revisionable)
}
