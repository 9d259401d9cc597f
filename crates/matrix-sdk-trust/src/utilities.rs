// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    fmt::Debug,
    sync::{MutexGuard, RwLockReadGuard, RwLockWriteGuard},
};

/// Super trait for the async traits of this crate, the implementations need
/// to be shareable between tasks.
pub trait AsyncTraitDeps: Debug + Send + Sync {}

impl<T: Debug + Send + Sync> AsyncTraitDeps for T {}

/// A read-write lock that ignores lock poisoning.
#[derive(Debug, Default)]
pub(crate) struct StdRwLock<T>(std::sync::RwLock<T>);

impl<T> StdRwLock<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(std::sync::RwLock::new(value))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// A mutex that ignores lock poisoning, see [`StdRwLock`].
#[derive(Debug, Default)]
pub(crate) struct StdMutex<T>(std::sync::Mutex<T>);

impl<T> StdMutex<T> {
    pub(crate) fn new(value: T) -> Self {
        Self(std::sync::Mutex::new(value))
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }
}
