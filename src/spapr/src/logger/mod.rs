// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process logger used by the RTAS and PHB subsystems.

mod logging;

pub use crate::logger::logging::{
    DEFAULT_LEVEL, LOGGER, LevelFilter, LevelFilterFromStrError, Logger, LoggerConfig,
    LoggerInitError, LoggerUpdateError,
};
