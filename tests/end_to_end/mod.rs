mod lease_expiry;
mod stale_discovery;
