// BSD 2-Clause License
//
// Copyright (c) 2020 Brian Campbell
// Copyright (c) 2020 Alasdair Armstrong
//
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
// 1. Redistributions of source code must retain the above copyright
// notice, this list of conditions and the following disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright
// notice, this list of conditions and the following disclaimer in the
// documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT
// LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR
// A PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT
// HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT
// LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE,
// DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY
// THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT
// (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE
// OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use env_logger::{init_from_env, Env, DEFAULT_FILTER_ENV};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;

use std::process::exit;

use rtm_fi::campaign::{self, Campaign, CampaignContext};
use rtm_fi::config::{self, Parsed};
use rtm_fi::injector::DebuggerBackend;

fn main() {
    init_from_env(Env::default().filter_or(DEFAULT_FILTER_ENV, "info"));
    exit(rtm_fi_main())
}

fn rtm_fi_main() -> i32 {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match config::parse_args(&args, |name| std::env::var(name).ok()) {
        Ok(Parsed::Run(config)) => config,
        Ok(Parsed::Help(usage)) => {
            print!("{}", usage);
            return 0;
        }
        Err(err) => {
            eprintln!("{}", err);
            eprintln!("{}", config::options().short_usage("rtm-fi"));
            return 1;
        }
    };

    if config.ptrace_setup {
        if let Err(err) = campaign::lower_ptrace_scope() {
            warn!("Unable to lower ptrace_scope, the debugger may fail to attach: {}", err);
        }
    }

    let rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let context = match CampaignContext::prepare(config) {
        Ok(context) => context,
        Err(err) => {
            error!("{}", err);
            return 1;
        }
    };

    let backend = DebuggerBackend::new(&context.config);
    let records = match Campaign::new(&context, backend, rng).run() {
        Ok(records) => records,
        Err(err) => {
            error!("Campaign aborted: {}", err);
            return 1;
        }
    };

    info!("---------- Complete, {} runs recorded in {}", records.len(), context.config.ledger_path().display());
    for (entry, count) in campaign::tally(&records) {
        info!("{:>10}: {}", entry.to_string(), count);
    }
    0
}
