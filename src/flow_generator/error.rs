/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("http first line too short")]
    FirstLineTooShort,
    #[error("invalid http status code")]
    InvalidStatusCode,
    #[error("invalid http request line")]
    InvalidRequestLine,
    #[error("invalid http version")]
    InvalidVersion,
    #[error("http header line without colon")]
    HeaderWithoutColon,
    #[error("invalid chunk size")]
    InvalidChunkSize,
    #[error("expected CRLF after chunk data")]
    MissingChunkCrlf,
    #[error("stream data too large: {0} bytes")]
    StreamTooLarge(usize),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
