use std::sync::Mutex;

use anyhow::{anyhow, Result};

use crate::models::{Credential, Notice, UserProfile};

/**
 * \brief 平台配置记录中的 API Key 读写端口。
 */
pub trait CredentialStore: Send + Sync {
    /** \brief 读取已保存的 Key，不存在时返回 None。 */
    fn load_key(&self) -> Result<Option<Credential>>;
    /** \brief 以新记录的方式保存 Key。 */
    fn save_key(&self, key: &Credential) -> Result<()>;
}

/**
 * \brief 当前用户资料读取端口。
 */
pub trait ProfileSource: Send + Sync {
    fn current_user(&self) -> Result<Option<UserProfile>>;
}

/**
 * \brief 用户通知端口（toast）。
 */
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/**
 * \brief 进程内存储，用于测试与临时运行。
 */
#[derive(Debug, Default)]
pub struct MemoryStore {
    keys: Mutex<Vec<Credential>>,
    profile: Mutex<Option<UserProfile>>,
    fail_saves: bool,
    fail_loads: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: UserProfile) -> Self {
        Self {
            profile: Mutex::new(Some(profile)),
            ..Self::default()
        }
    }

    /**
     * \brief 保存操作总是失败的存储，用于模拟持久化异常。
     */
    pub fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::default()
        }
    }

    /**
     * \brief 读取 Key 与用户资料总是失败的存储。
     */
    pub fn failing_loads() -> Self {
        Self {
            fail_loads: true,
            ..Self::default()
        }
    }

    pub fn set_profile(&self, profile: Option<UserProfile>) {
        if let Ok(mut guard) = self.profile.lock() {
            *guard = profile;
        }
    }

    /** \brief 已保存的记录条数。 */
    pub fn saved_count(&self) -> usize {
        self.keys.lock().map(|k| k.len()).unwrap_or(0)
    }
}

impl CredentialStore for MemoryStore {
    fn load_key(&self) -> Result<Option<Credential>> {
        if self.fail_loads {
            return Err(anyhow!("insufficient access to read configuration record"));
        }
        let keys = self.keys.lock().map_err(|_| anyhow!("key store poisoned"))?;
        Ok(keys.last().cloned())
    }

    fn save_key(&self, key: &Credential) -> Result<()> {
        if self.fail_saves {
            return Err(anyhow!("insufficient access to create configuration record"));
        }
        let mut keys = self.keys.lock().map_err(|_| anyhow!("key store poisoned"))?;
        keys.push(key.clone());
        Ok(())
    }
}

impl ProfileSource for MemoryStore {
    fn current_user(&self) -> Result<Option<UserProfile>> {
        if self.fail_loads {
            return Err(anyhow!("insufficient access to read user record"));
        }
        let profile = self
            .profile
            .lock()
            .map_err(|_| anyhow!("profile store poisoned"))?;
        Ok(profile.clone())
    }
}

/**
 * \brief 把通知缓存在队列中，由调用方拉取。
 */
#[derive(Debug, Default)]
pub struct QueuedNotifier {
    queue: Mutex<Vec<Notice>>,
}

impl QueuedNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /** \brief 取出并清空当前队列。 */
    pub fn drain(&self) -> Vec<Notice> {
        self.queue
            .lock()
            .map(|mut q| std::mem::take(&mut *q))
            .unwrap_or_default()
    }
}

impl Notifier for QueuedNotifier {
    fn notify(&self, notice: Notice) {
        if let Ok(mut q) = self.queue.lock() {
            q.push(notice);
        }
    }
}
