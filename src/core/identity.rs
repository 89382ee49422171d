use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    pub const ANONYMOUS: UserId = UserId(0);
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
}

impl User {
    pub fn new(id: UserId, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
        }
    }
}

/// 当前操作者
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> UserId;
}

/// 固定身份（CLI 引导 / HTTP 请求头解析后）
#[derive(Copy, Clone, Debug)]
pub struct StaticIdentity(pub UserId);

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> UserId {
        self.0
    }
}

/// user 引用解析
pub trait UserDirectory: Send + Sync {
    fn load_user(&self, id: UserId) -> Option<User>;
}

#[derive(Default)]
pub struct MemoryUserDirectory {
    users: DashMap<UserId, User>,
}

impl MemoryUserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_users(users: impl IntoIterator<Item = User>) -> Self {
        let dir = Self::new();
        for u in users {
            dir.insert(u);
        }
        dir
    }

    pub fn insert(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl UserDirectory for MemoryUserDirectory {
    fn load_user(&self, id: UserId) -> Option<User> {
        self.users.get(&id).map(|u| u.value().clone())
    }
}
