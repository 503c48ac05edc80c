//! DDL for the job table.
//!
//! `seq` breaks ties between jobs enqueued in the same microsecond so lease
//! order stays FIFO.

pub(crate) const STATEMENTS: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS jobs (
        id UUID PRIMARY KEY,
        seq BIGSERIAL NOT NULL,
        lane TEXT NOT NULL CHECK (char_length(lane) BETWEEN 1 AND 64),
        payload JSONB NOT NULL,
        state TEXT NOT NULL
            CHECK (state IN ('waiting', 'active', 'completed', 'failed', 'delayed')),
        attempts INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
        max_attempts INTEGER NOT NULL CHECK (max_attempts >= 1),
        next_run_at TIMESTAMPTZ NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        leased_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        last_error TEXT,
        CHECK (attempts <= max_attempts)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_jobs_lease
    ON jobs (lane, state, next_run_at, created_at, seq)
    WHERE state IN ('waiting', 'delayed')
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_jobs_active
    ON jobs (lane, leased_at)
    WHERE state = 'active'
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_jobs_terminal
    ON jobs (lane, state, completed_at DESC, failed_at)
    WHERE state IN ('completed', 'failed')
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_jobs_recent
    ON jobs (lane, created_at DESC, seq DESC)
    ",
];
