/// Generate SQL migrations for the family edge tables
///
/// Both tables key a row by the member and the group, so a member has at most
/// one parent and one partner per group. Identities are stored as `BIGINT`
/// holding the bit pattern of the unsigned id.
pub fn generate_migrations() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "20240601000000_family_edges",
            r#"
            -- One row per child: who their parent is
            CREATE TABLE IF NOT EXISTS parents (
                parent_id BIGINT NOT NULL,
                child_id BIGINT NOT NULL,
                guild_id BIGINT NOT NULL DEFAULT 0,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (child_id, guild_id)
            );

            -- Children are looked up by parent
            CREATE INDEX IF NOT EXISTS idx_parents_parent_guild ON parents(parent_id, guild_id);

            -- Two rows per union, one from each side
            CREATE TABLE IF NOT EXISTS marriages (
                user_id BIGINT NOT NULL,
                partner_id BIGINT NOT NULL,
                guild_id BIGINT NOT NULL DEFAULT 0,
                timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (user_id, guild_id)
            );
            "#,
        ),
        (
            "20240602000000_partner_lookup_index",
            r#"
            -- Divorce deletes by either side of the pair
            CREATE INDEX IF NOT EXISTS idx_marriages_partner_guild ON marriages(partner_id, guild_id);
            "#,
        ),
    ]
}
