// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::ops::Deref;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use hyper::server::accept::Accept;
use hyper::server::conn::{AddrIncoming, AddrStream};

/// Adapts a hyper `AddrIncoming` into a `Stream` of accepted connections, which is what
/// `tonic::transport::Server::serve_with_incoming_shutdown` expects.
pub struct AddrIncomingWithStream(pub AddrIncoming);

impl Deref for AddrIncomingWithStream {
    type Target = AddrIncoming;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Stream for AddrIncomingWithStream {
    type Item = Result<AddrStream, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.0).poll_accept(cx)
    }
}
