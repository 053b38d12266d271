pub(crate) mod bucket;
pub(crate) mod checker;
pub(crate) mod chunk;
pub(crate) mod config;
pub(crate) mod error;
pub(crate) mod global;
pub(crate) mod reservation;
pub(crate) mod source;
pub(crate) mod stats;
pub(crate) mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
