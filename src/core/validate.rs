use std::sync::Arc;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use crate::core::field::{Constraint, FieldDefinition, FieldKind, FieldValue, WORKSPACE_FIELDS};
use crate::core::identity::{UserDirectory, UserId};
use crate::core::workspace::{Workspace, WorkspaceId};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Error)]
#[error("workspace validation failed: {}", join_violations(.violations))]
pub struct ValidationErrors {
    pub violations: Vec<Violation>,
}

impl ValidationErrors {
    pub fn has_field(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }
}

fn join_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.message))
        .collect::<Vec<_>>()
        .join("; ")
}

/// 保存前的校验管线：遍历 schema 表，收集全部 violation（不在第一条失败处停下）。
pub struct Validator {
    default_workspace: WorkspaceId,
    patterns: Vec<(&'static str, Regex)>,
    /// 设置后检查 user 引用是否存在
    users: Option<Arc<dyn UserDirectory>>,
}

impl Validator {
    pub fn new(default_workspace: WorkspaceId) -> Result<Self, regex::Error> {
        let mut patterns = Vec::new();
        for def in WORKSPACE_FIELDS {
            for c in def.constraints {
                if let Constraint::Pattern(p) = c {
                    if !patterns.iter().any(|(q, _)| q == p) {
                        patterns.push((*p, Regex::new(p)?));
                    }
                }
            }
        }
        Ok(Self {
            default_workspace,
            patterns,
            users: None,
        })
    }

    pub fn with_users(mut self, users: Arc<dyn UserDirectory>) -> Self {
        self.users = Some(users);
        self
    }

    pub fn default_workspace(&self) -> WorkspaceId {
        self.default_workspace
    }

    /// `original`：已持久化的版本（新建时为 None），用于只读字段检查
    pub fn validate(
        &self,
        ws: &Workspace,
        original: Option<&Workspace>,
    ) -> Result<(), ValidationErrors> {
        let mut violations = Vec::new();
        for def in WORKSPACE_FIELDS {
            self.check_field(def, ws, original, &mut violations);
        }
        if violations.is_empty() {
            Ok(())
        } else {
            tracing::debug!(
                "Workspace {:?} rejected: {} violation(s)",
                ws.machine_name(),
                violations.len()
            );
            Err(ValidationErrors { violations })
        }
    }

    fn check_field(
        &self,
        def: &FieldDefinition,
        ws: &Workspace,
        original: Option<&Workspace>,
        out: &mut Vec<Violation>,
    ) {
        let value = ws.field(def.name);

        if def.required && value.is_empty() {
            out.push(Violation {
                field: def.name,
                message: format!("{} field is required.", def.label),
            });
            return;
        }

        if let (Some(max), Some(s)) = (def.max_length, value.as_str()) {
            let len = s.chars().count();
            if len > max {
                out.push(Violation {
                    field: def.name,
                    message: format!(
                        "{}: may not be longer than {} characters ({} given).",
                        def.label, max, len
                    ),
                });
            }
        }

        // id / revision_id 由 storage 分配，只检查用户可写的只读字段
        if def.read_only && def.name != "id" && def.name != "revision_id" {
            if let Some(orig) = original {
                if orig.field(def.name) != value {
                    out.push(Violation {
                        field: def.name,
                        message: format!("{} is read-only and cannot be changed.", def.label),
                    });
                }
            }
        }

        match def.kind {
            FieldKind::EntityReference { target_type: "user" } => {
                self.check_user_reference(def, ws, out);
            }
            // 基于旧 revision 的副本不能覆盖更新的保存
            FieldKind::Changed => {
                if let Some(orig) = original {
                    if orig.revision_id() != ws.revision_id() {
                        out.push(Violation {
                            field: def.name,
                            message: format!(
                                "The workspace {:?} has been modified since it was loaded (revision {:?}, current {:?}).",
                                ws.machine_name(),
                                ws.revision_id().map(|r| r.0),
                                orig.revision_id().map(|r| r.0)
                            ),
                        });
                    }
                }
            }
            _ => {}
        }

        for c in def.constraints {
            match c {
                Constraint::Pattern(p) => {
                    let Some(s) = value.as_str() else { continue };
                    let matched = self
                        .patterns
                        .iter()
                        .find(|(q, _)| q == p)
                        .map(|(_, re)| re.is_match(s))
                        .unwrap_or(false);
                    if !matched {
                        out.push(Violation {
                            field: def.name,
                            message: format!("{} value {:?} does not match {}.", def.label, s, p),
                        });
                    }
                }
                Constraint::UnpublishDefault => {
                    if value == FieldValue::Boolean(false)
                        && ws.is_default_workspace(self.default_workspace)
                    {
                        out.push(Violation {
                            field: def.name,
                            message: format!(
                                "The default workspace ({}) cannot be unpublished.",
                                ws.machine_name()
                            ),
                        });
                    }
                }
            }
        }
    }

    fn check_user_reference(
        &self,
        def: &FieldDefinition,
        ws: &Workspace,
        out: &mut Vec<Violation>,
    ) {
        let (Some(users), Some(uid)) = (&self.users, ws.owner_id()) else {
            return;
        };
        // 匿名用户不在目录里
        if uid == UserId::ANONYMOUS || users.load_user(uid).is_some() {
            return;
        }
        out.push(Violation {
            field: def.name,
            message: format!("{}: the referenced user ({}) does not exist.", def.label, uid.0),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::{MemoryUserDirectory, User};
    use crate::core::workspace::{RevisionId, WorkspaceTypeId};

    fn validator() -> Validator {
        Validator::new(WorkspaceId(1)).unwrap()
    }

    fn ws(machine_name: &str) -> Workspace {
        Workspace::new(WorkspaceTypeId::default(), "Label", machine_name)
    }

    #[test]
    fn machine_name_charset_accepted() {
        let v = validator();
        for name in ["live", "stage_2", "a$b(c)+d-e/f", "dev.local", "0123", "x,y"] {
            assert!(v.validate(&ws(name), None).is_ok(), "{name} should pass");
        }
    }

    #[test]
    fn machine_name_with_space_or_uppercase_rejected() {
        let v = validator();
        for name in ["has space", "Live", "tab\t", "ümlaut", "a*b"] {
            let err = v.validate(&ws(name), None).unwrap_err();
            assert!(err.has_field("machine_name"), "{name} should fail");
        }
    }

    #[test]
    fn required_fields_reported_together() {
        let v = validator();
        let w = Workspace::new(WorkspaceTypeId::default(), "", "");
        let err = v.validate(&w, None).unwrap_err();
        assert!(err.has_field("label"));
        assert!(err.has_field("machine_name"));
        assert_eq!(err.violations.len(), 2);
    }

    #[test]
    fn max_length_counts_characters() {
        let v = validator();
        let ok = Workspace::new(WorkspaceTypeId::default(), &"é".repeat(128), "a");
        assert!(v.validate(&ok, None).is_ok());

        let long = Workspace::new(WorkspaceTypeId::default(), &"x".repeat(129), &"a".repeat(129));
        let err = v.validate(&long, None).unwrap_err();
        assert!(err.has_field("label"));
        assert!(err.has_field("machine_name"));
    }

    #[test]
    fn default_workspace_cannot_be_unpublished() {
        let v = validator();
        let mut live = ws("live");
        live.id = Some(WorkspaceId(1));
        live.set_unpublished();
        let err = v.validate(&live, None).unwrap_err();
        assert!(err.has_field("published"));

        let mut stage = ws("stage");
        stage.id = Some(WorkspaceId(2));
        stage.set_unpublished();
        assert!(v.validate(&stage, None).is_ok());
    }

    #[test]
    fn type_is_read_only_after_creation() {
        let v = validator();
        let orig = ws("stage");
        let mut changed = orig.clone();
        changed.workspace_type = WorkspaceTypeId("other".to_string());
        let err = v.validate(&changed, Some(&orig)).unwrap_err();
        assert!(err.has_field("type"));

        // 新建时没有 original，任意 type 都可以
        assert!(v.validate(&changed, None).is_ok());
    }

    #[test]
    fn stale_copy_is_rejected_on_changed() {
        let v = validator();
        let mut current = ws("stage");
        current.id = Some(WorkspaceId(2));
        current.revision_id = Some(RevisionId(5));

        let mut stale = current.clone();
        stale.revision_id = Some(RevisionId(4));
        let err = v.validate(&stale, Some(&current)).unwrap_err();
        assert!(err.has_field("changed"));

        assert!(v.validate(&current.clone(), Some(&current)).is_ok());
    }

    #[test]
    fn owner_must_exist_when_directory_is_set() {
        let users = Arc::new(MemoryUserDirectory::from_users([User::new(UserId(7), "editor")]));
        let v = validator().with_users(users);

        let mut w = ws("stage");
        w.set_owner_id(UserId(7));
        assert!(v.validate(&w, None).is_ok());

        w.set_owner_id(UserId::ANONYMOUS);
        assert!(v.validate(&w, None).is_ok());

        w.set_owner_id(UserId(424242));
        let err = v.validate(&w, None).unwrap_err();
        assert!(err.has_field("uid"));

        // 未配置目录时不检查
        assert!(validator().validate(&w, None).is_ok());
    }
}
