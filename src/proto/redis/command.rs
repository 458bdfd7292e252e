//! RESP command table.
//!
//! Every command the proxy understands gets a routing category, a batch step
//! (how many array elements after the command name form one sub-request) and
//! a merge rule for reassembling sub-responses.

/// How sub-responses recombine into the client-visible response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeType {
    /// Single sub-response passed through.
    Basic,
    /// Array-concatenate sub-responses in key order (MGET).
    Join,
    /// Sum the integer sub-replies (DEL, EXISTS).
    Count,
    /// First error wins, else `+OK` (MSET).
    Ok,
}

/// Routing category of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdKind {
    Supported,
    Unsupported,
    Control,
}

/// Static description of one command.
#[derive(Debug, Clone, Copy)]
pub struct CmdSpec {
    pub kind: CmdKind,
    /// 0 = not batchable; N = one sub-request per N elements after the name.
    pub batch_step: usize,
    pub merge: MergeType,
    /// Command name of the generated sub-requests, when it differs.
    pub sub_cmd: Option<&'static str>,
}

const fn supported() -> CmdSpec {
    CmdSpec {
        kind: CmdKind::Supported,
        batch_step: 0,
        merge: MergeType::Basic,
        sub_cmd: None,
    }
}

const fn batchable(step: usize, merge: MergeType, sub_cmd: Option<&'static str>) -> CmdSpec {
    CmdSpec {
        kind: CmdKind::Supported,
        batch_step: step,
        merge,
        sub_cmd,
    }
}

const fn control() -> CmdSpec {
    CmdSpec {
        kind: CmdKind::Control,
        batch_step: 0,
        merge: MergeType::Basic,
        sub_cmd: None,
    }
}

const fn unsupported() -> CmdSpec {
    CmdSpec {
        kind: CmdKind::Unsupported,
        batch_step: 0,
        merge: MergeType::Basic,
        sub_cmd: None,
    }
}

/// Look up a command by its uppercased name. Unknown names are unsupported.
pub fn lookup(cmd: &str) -> CmdSpec {
    match cmd {
        // local control commands
        "PING" | "QUIT" | "AUTH" | "ECHO" | "SELECT" => control(),

        // multi-key commands, split and merged
        "MGET" => batchable(1, MergeType::Join, Some("GET")),
        "MSET" => batchable(2, MergeType::Ok, Some("SET")),
        "DEL" => batchable(1, MergeType::Count, None),
        "EXISTS" => batchable(1, MergeType::Count, None),

        // single-key string commands
        "GET" | "SET" | "GETSET" | "SETNX" | "SETEX" | "PSETEX" | "APPEND" | "STRLEN"
        | "INCR" | "DECR" | "INCRBY" | "DECRBY" | "INCRBYFLOAT" | "GETRANGE" | "SETRANGE"
        | "GETBIT" | "SETBIT" | "BITCOUNT" | "BITPOS" => supported(),

        // key management
        "EXPIRE" | "EXPIREAT" | "PEXPIRE" | "PEXPIREAT" | "TTL" | "PTTL" | "PERSIST"
        | "TYPE" | "DUMP" | "RESTORE" | "SORT" => supported(),

        // hashes
        "HDEL" | "HEXISTS" | "HGET" | "HGETALL" | "HINCRBY" | "HINCRBYFLOAT" | "HKEYS"
        | "HLEN" | "HMGET" | "HMSET" | "HSET" | "HSETNX" | "HSTRLEN" | "HVALS" | "HSCAN" => {
            supported()
        }

        // lists
        "LINDEX" | "LINSERT" | "LLEN" | "LPOP" | "LPUSH" | "LPUSHX" | "LRANGE" | "LREM"
        | "LSET" | "LTRIM" | "RPOP" | "RPOPLPUSH" | "RPUSH" | "RPUSHX" => supported(),

        // sets
        "SADD" | "SCARD" | "SDIFF" | "SDIFFSTORE" | "SINTER" | "SINTERSTORE" | "SISMEMBER"
        | "SMEMBERS" | "SMOVE" | "SPOP" | "SRANDMEMBER" | "SREM" | "SUNION" | "SUNIONSTORE"
        | "SSCAN" => supported(),

        // sorted sets
        "ZADD" | "ZCARD" | "ZCOUNT" | "ZINCRBY" | "ZLEXCOUNT" | "ZRANGE" | "ZRANGEBYLEX"
        | "ZRANGEBYSCORE" | "ZRANK" | "ZREM" | "ZREMRANGEBYLEX" | "ZREMRANGEBYRANK"
        | "ZREMRANGEBYSCORE" | "ZREVRANGE" | "ZREVRANGEBYLEX" | "ZREVRANGEBYSCORE"
        | "ZREVRANK" | "ZSCAN" | "ZSCORE" => supported(),

        // hyperloglog and geo
        "PFADD" | "PFCOUNT" | "GEOADD" | "GEODIST" | "GEOHASH" | "GEOPOS" | "GEORADIUS"
        | "GEORADIUSBYMEMBER" => supported(),

        // everything else (keyspace scans, pubsub, transactions, admin)
        _ => unsupported(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batchable_specs() {
        let mget = lookup("MGET");
        assert_eq!(mget.batch_step, 1);
        assert_eq!(mget.merge, MergeType::Join);
        assert_eq!(mget.sub_cmd, Some("GET"));

        let mset = lookup("MSET");
        assert_eq!(mset.batch_step, 2);
        assert_eq!(mset.merge, MergeType::Ok);

        let del = lookup("DEL");
        assert_eq!(del.batch_step, 1);
        assert_eq!(del.merge, MergeType::Count);
        assert_eq!(del.sub_cmd, None);
    }

    #[test]
    fn test_categories() {
        assert_eq!(lookup("GET").kind, CmdKind::Supported);
        assert_eq!(lookup("PING").kind, CmdKind::Control);
        assert_eq!(lookup("KEYS").kind, CmdKind::Unsupported);
        assert_eq!(lookup("SUBSCRIBE").kind, CmdKind::Unsupported);
        assert_eq!(lookup("NO_SUCH_CMD").kind, CmdKind::Unsupported);
    }
}
